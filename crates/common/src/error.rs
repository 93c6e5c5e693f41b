//! Error types for wgpeer

use thiserror::Error;

/// Result type alias using wgpeer Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgpeer error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Address pool exhausted: no free {family} addresses left")]
    PoolExhausted { family: String },

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Peer store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Config write failed: {0}")]
    ConfigWriteFailed(String),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Interface apply failed: {0}")]
    InterfaceApplyFailed(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failing create may be retried by allocating again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DuplicateKey(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::DuplicateKey(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => Error::StoreUnavailable(e.to_string()),
        }
    }
}
