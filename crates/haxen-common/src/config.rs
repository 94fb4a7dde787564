use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the key custody backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreConfig {
    /// Directory holding local key material.
    pub path: PathBuf,
    /// Backend selector; only "local" is implemented.
    #[serde(default = "default_keystore_kind")]
    pub kind: String,
}

fn default_keystore_kind() -> String {
    "local".to_string()
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            path: crate::paths::HaxenDirs::default_home().join("data").join("keys"),
            kind: default_keystore_kind(),
        }
    }
}

/// Configuration for the DID subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DIDConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub keystore: KeystoreConfig,
}

/// Configuration for the local SQLite storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub database_path: PathBuf,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            database_path: crate::paths::HaxenDirs::default_home()
                .join("data")
                .join("haxen.db"),
        }
    }
}

/// Top-level storage configuration. Alternate backends are swappable
/// implementations of the same provider contract, selected by `mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_mode")]
    pub mode: String,
    #[serde(default)]
    pub local: LocalStorageConfig,
}

fn default_storage_mode() -> String {
    "local".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: default_storage_mode(),
            local: LocalStorageConfig::default(),
        }
    }
}
