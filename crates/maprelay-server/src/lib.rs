//! maprelay Server - Axum-based HTTP front end
//!
//! Serves the login start and status endpoints, the proxied sign-in pages
//! under `/login/<id>/...`, and the credential import API.

pub mod http;
pub mod state;

pub use http::create_router;
pub use state::AppState;
