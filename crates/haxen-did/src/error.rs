use thiserror::Error;

use haxen_keystore::KeystoreError;
use haxen_storage::StorageError;

/// Errors surfaced by the DID registry and its services.
#[derive(Debug, Error)]
pub enum DIDError {
    #[error("haxen server registry not initialized")]
    RegistryNotInitialized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("keystore failure: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("storage failure: {0}")]
    Storage(StorageError),

    #[error("credential error: {0}")]
    Credential(String),
}

/// Result type for DID operations.
pub type DIDResult<T> = Result<T, DIDError>;

impl From<StorageError> for DIDError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => DIDError::NotFound(what),
            other => DIDError::Storage(other),
        }
    }
}

impl From<serde_json::Error> for DIDError {
    fn from(err: serde_json::Error) -> Self {
        DIDError::Credential(format!("serialization failed: {}", err))
    }
}
