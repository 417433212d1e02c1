//! maprelay Proxy - The sign-in proxy session
//!
//! A [`ProxySession`] owns one outbound HTTP client and cookie jar and walks
//! the provider's sign-in pages on behalf of a browser:
//!
//! 1. `ProxySession::new()` builds the start URL and seeds the cookie jar
//! 2. `start()` records the browser-facing proxy base and fetches the first page
//! 3. `forward()` replays each browser interaction against the provider and
//!    rewrites HTML so navigation keeps flowing through the proxy
//! 4. When a redirect carries `openid.oa2.access_token`, the login is complete
//! 5. `register_device()` exchanges the token for a [`RegistrationBundle`]
//!
//! [`RegistrationBundle`]: maprelay_core::RegistrationBundle

pub mod cookies;
pub mod error;
pub mod register;
pub mod rewrite;
pub mod session;

pub use error::{ProxyError, ProxyResult};
pub use rewrite::rewrite_html;
pub use session::{
    LastRequest, LoginState, ProxiedResponse, ProxyOptions, ProxyRequest, ProxySession,
    USER_AGENT,
};
