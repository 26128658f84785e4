//! Error types for pushrelay
//!
//! Defines the crate-wide error enum. Component errors (store, codec, token)
//! keep their own thiserror enums and convert into [`RelayError`] with `?`.

use crate::protocol::{CodecError, TokenError};
use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for pushrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Top-level error type for pushrelay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence port errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Wire message errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Endpoint token errors
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// HTTP server errors (bind, serve)
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Whether this error came from the persistence layer
    pub fn is_persistence(&self) -> bool {
        matches!(self, RelayError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts() {
        let err: RelayError = StoreError::NotFound("c1".to_string()).into();
        assert!(err.is_persistence());
        assert!(err.to_string().contains("c1"));
    }

    #[test]
    fn test_sqlite_error_surfaces_as_store_error() {
        let store_err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        let err: RelayError = store_err.into();
        assert!(matches!(err, RelayError::Store(StoreError::Database(_))));
        assert!(err.is_persistence());
    }

    #[test]
    fn test_config_error_display() {
        let err = RelayError::Config("bad port".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad port");
        assert!(!err.is_persistence());
    }
}
