//! Proxy error types

use thiserror::Error;

/// Errors that can occur while driving a sign-in session
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Core(#[from] maprelay_core::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Login not completed")]
    LoginNotComplete,

    #[error("Login session is closed")]
    SessionClosed,

    #[error("Login session has not been started")]
    NotStarted,

    #[error("Device registration failed (status {status}): {body}")]
    Registration { status: u16, body: String },

    #[error("Invalid registration response: {0}")]
    InvalidRegistration(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::Core(err.into())
    }
}

impl ProxyError {
    /// Whether the provider could not be reached or timed out
    pub fn is_transport(&self) -> bool {
        matches!(self, ProxyError::Http(_))
    }
}
