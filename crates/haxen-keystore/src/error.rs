use thiserror::Error;

/// Errors that can occur during key custody operations.
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("unsupported keystore backend: {0}")]
    UnsupportedBackend(String),

    #[error("keystore path is unusable: {0}")]
    UnsafePath(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("derivation path already consumed: {0}")]
    PathCollision(String),

    #[error("keystore I/O error: {0}")]
    Io(String),

    #[error("key serialization error: {0}")]
    Serialization(String),
}

/// Result type for keystore operations.
pub type KeystoreResult<T> = Result<T, KeystoreError>;

impl From<std::io::Error> for KeystoreError {
    fn from(err: std::io::Error) -> Self {
        KeystoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for KeystoreError {
    fn from(err: serde_json::Error) -> Self {
        KeystoreError::Serialization(err.to_string())
    }
}
