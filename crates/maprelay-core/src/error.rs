//! Error types for maprelay

use thiserror::Error;

/// Main error type for maprelay core operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown marketplace: {0}")]
    UnknownMarketplace(String),

    #[error("Login with username is only supported for DE, US and UK marketplaces (got {0})")]
    UnsupportedLoginMode(String),

    #[error("Invalid credential file: {0}")]
    InvalidCredentialFile(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using maprelay's Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid credential file error
    pub fn invalid_credential_file(reason: impl Into<String>) -> Self {
        Error::InvalidCredentialFile(reason.into())
    }

    /// Whether this error was caused by caller input rather than the provider
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownMarketplace(_)
                | Error::UnsupportedLoginMode(_)
                | Error::InvalidCredentialFile(_)
        )
    }
}
