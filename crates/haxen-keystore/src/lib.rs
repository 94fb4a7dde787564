/*!
# Haxen Keystore

Custody of the root key material for a haxen server and deterministic
derivation of per-entity signing keys. Key material lives under an
access-restricted directory and is exposed to the rest of the system only by
reference; the sole exceptions are the explicit export and rotation paths.
*/

mod error;
mod local;

pub use error::{KeystoreError, KeystoreResult};
pub use local::LocalKeystore;

use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use haxen_common::PublicKeyJwk;

/// Position of a key in a haxen server's derivation hierarchy.
///
/// The same path always derives the same key pair, which is what keeps DIDs
/// resolvable across restarts. Uniqueness of `index` per server is enforced
/// by the caller's index allocation, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationPath {
    pub haxen_server_id: String,
    pub index: u64,
}

impl DerivationPath {
    pub fn new(haxen_server_id: impl Into<String>, index: u64) -> Self {
        Self {
            haxen_server_id: haxen_server_id.into(),
            index,
        }
    }

    /// Canonical rendering fed into the derivation function.
    pub fn render(&self) -> String {
        format!("m/haxen/{}/{}", self.haxen_server_id, self.index)
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Opaque handle to a custodied key. The only way key material crosses the
/// keystore boundary in normal operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRef(String);

impl KeyRef {
    /// Reference to a server's root key.
    pub fn root(haxen_server_id: &str) -> Self {
        Self(format!("root/{}", haxen_server_id))
    }

    /// Reference to a derived child key.
    pub fn child(path: &DerivationPath) -> Self {
        Self(format!("child/{}/{}", path.haxen_server_id, path.index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability interface for key custody backends.
///
/// Any backend must derive deterministically given a path and must refuse to
/// operate over an unreadable or world-accessible key directory.
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Ensure root key material exists for the server, creating a fresh seed
    /// if absent, and return the root public key with its reference.
    async fn ensure_root(&self, haxen_server_id: &str) -> KeystoreResult<(PublicKeyJwk, KeyRef)>;

    /// Derive a new key pair at the given path. Fails with a path collision if
    /// the path was already consumed.
    async fn generate(&self, path: &DerivationPath) -> KeystoreResult<(PublicKeyJwk, KeyRef)>;

    /// Sign a payload with a custodied key. Fails with `KeyNotFound` when the
    /// reference is stale or its material was never generated.
    async fn sign(&self, key_ref: &KeyRef, payload: &[u8]) -> KeystoreResult<Vec<u8>>;

    /// Replace the server's root seed with fresh material, returning the new
    /// root public key. Previously derived child keys become unrecoverable.
    async fn rotate_root(&self, haxen_server_id: &str) -> KeystoreResult<(PublicKeyJwk, KeyRef)>;

    /// Controlled export of the raw root seed for backup. The only read path
    /// that returns private material.
    async fn export_root_seed(&self, haxen_server_id: &str) -> KeystoreResult<Vec<u8>>;
}

/// Verify an Ed25519 signature against a public key in JWK form.
pub fn verify_signature(jwk: &PublicKeyJwk, payload: &[u8], signature: &[u8]) -> KeystoreResult<bool> {
    let key_bytes = URL_SAFE_NO_PAD
        .decode(&jwk.x)
        .map_err(|e| KeystoreError::Serialization(format!("invalid JWK x parameter: {}", e)))?;
    let key_bytes: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeystoreError::Serialization("JWK x parameter is not 32 bytes".to_string()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| KeystoreError::Serialization(format!("invalid Ed25519 public key: {}", e)))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| KeystoreError::Serialization(format!("invalid signature bytes: {}", e)))?;
    Ok(verifying_key.verify(payload, &signature).is_ok())
}
