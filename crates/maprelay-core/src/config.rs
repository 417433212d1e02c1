//! Configuration types for maprelay

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for maprelay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind: IpAddr,
    /// Server port
    pub port: u16,
    /// Browser-facing base URL (e.g. `https://relay.example.com`).
    /// Derived from the request's Host header when unset.
    pub public_url: Option<String>,
    /// Lifetime of a login attempt in seconds
    pub session_ttl_secs: i64,
    /// Interval between expiry sweeps in seconds
    pub sweep_interval_secs: u64,
    /// Timeout for each outbound request to the provider in seconds
    pub request_timeout_secs: u64,
    /// Path of the registered-device store (platform config dir if None)
    pub store_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([127, 0, 0, 1]),
            port: 8080,
            public_url: None,
            session_ttl_secs: 300,
            sweep_interval_secs: 60,
            request_timeout_secs: 30,
            store_path: None,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set bind address
    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set public URL
    pub fn with_public_url(mut self, url: Option<String>) -> Self {
        self.public_url = url.map(|u| u.trim_end_matches('/').to_string());
        self
    }

    /// Builder pattern: set session TTL
    pub fn with_session_ttl(mut self, secs: i64) -> Self {
        self.session_ttl_secs = secs;
        self
    }

    /// Builder pattern: set sweep interval
    pub fn with_sweep_interval(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    /// Builder pattern: set outbound request timeout
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Builder pattern: set store path
    pub fn with_store_path(mut self, path: Option<PathBuf>) -> Self {
        self.store_path = path;
        self
    }

    /// Check values that would make the relay unusable
    pub fn validate(&self) -> crate::Result<()> {
        if self.session_ttl_secs <= 0 {
            return Err(crate::Error::Config(
                "session TTL must be positive".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "request timeout must be at least one second".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(crate::Error::Config(
                "sweep interval must be at least one second".to_string(),
            ));
        }
        if let Some(url) = &self.public_url {
            url::Url::parse(url)?;
        }
        Ok(())
    }

    /// Outbound request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Sweep interval as a `Duration`
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
