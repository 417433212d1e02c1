//! maprelay Core - Shared types for the sign-in relay
//!
//! This crate provides the pure, network-free building blocks used by the
//! proxy, the session pool and the server: the marketplace table, synthetic
//! device identities, OAuth start-URL construction and the registration
//! bundle handed to persistence.

pub mod bundle;
pub mod config;
pub mod error;
pub mod identity;
pub mod marketplace;
pub mod oauth;

pub use bundle::{CustomerInfo, DeviceInfo, RegistrationBundle, StoreAuthenticationCookie};
pub use config::Config;
pub use error::{Error, Result};
pub use identity::{client_id, new_serial, DeviceIdentity, DEVICE_TYPE};
pub use marketplace::Marketplace;
pub use oauth::{access_token_from_url, build_start_url, register_url, ACCESS_TOKEN_PARAM};
