//! Shared application state

use maprelay_auth::{BundleStore, SessionPool};
use maprelay_core::Config;
use std::sync::Arc;

/// Shared state for all request handlers
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// In-flight sign-ins keyed by browser session
    pub pool: Arc<SessionPool>,
    /// Registered device store
    pub store: Arc<BundleStore>,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: Config, pool: Arc<SessionPool>, store: Arc<BundleStore>) -> Self {
        Self {
            config,
            pool,
            store,
        }
    }

    /// Lifetime of a new sign-in
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.session_ttl_secs)
    }
}
