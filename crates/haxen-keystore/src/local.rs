use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use haxen_common::{KeystoreConfig, PublicKeyJwk};

use crate::{DerivationPath, KeyRef, Keystore, KeystoreError, KeystoreResult};

const SEED_LEN: usize = 32;

/// File-backed keystore: one root seed per haxen server under an owner-only
/// directory, child keys derived on demand from the seed and the rendered
/// derivation path.
///
/// Layout: `{base}/{server_id}/seed` holds the root material and
/// `{base}/{server_id}/keys/{index}.jwk` marks each consumed derivation path
/// with its public key. Private bytes are never written outside `seed`.
#[derive(Debug)]
pub struct LocalKeystore {
    base: PathBuf,
}

impl LocalKeystore {
    pub fn new(config: &KeystoreConfig) -> KeystoreResult<Self> {
        if config.kind != "local" {
            return Err(KeystoreError::UnsupportedBackend(config.kind.clone()));
        }
        let base = config.path.clone();
        if base.exists() {
            check_directory_access(&base)?;
        } else {
            fs::create_dir_all(&base)?;
            restrict_to_owner(&base)?;
        }
        Ok(Self { base })
    }

    fn server_dir(&self, haxen_server_id: &str) -> PathBuf {
        self.base.join(haxen_server_id)
    }

    fn seed_path(&self, haxen_server_id: &str) -> PathBuf {
        self.server_dir(haxen_server_id).join("seed")
    }

    fn marker_path(&self, haxen_server_id: &str, index: u64) -> PathBuf {
        self.server_dir(haxen_server_id)
            .join("keys")
            .join(format!("{}.jwk", index))
    }

    fn load_seed(&self, haxen_server_id: &str) -> KeystoreResult<Vec<u8>> {
        let path = self.seed_path(haxen_server_id);
        if !path.exists() {
            return Err(KeystoreError::KeyNotFound(format!(
                "no root seed for haxen server {}",
                haxen_server_id
            )));
        }
        let seed = fs::read(&path)?;
        if seed.len() != SEED_LEN {
            return Err(KeystoreError::Serialization(format!(
                "root seed for haxen server {} has unexpected length {}",
                haxen_server_id,
                seed.len()
            )));
        }
        Ok(seed)
    }

    fn write_seed(&self, haxen_server_id: &str, overwrite: bool) -> KeystoreResult<()> {
        let dir = self.server_dir(haxen_server_id);
        fs::create_dir_all(&dir)?;
        restrict_to_owner(&dir)?;

        let mut seed = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed);
        write_restricted(&self.seed_path(haxen_server_id), &seed, overwrite)?;
        Ok(())
    }

    fn root_key(&self, haxen_server_id: &str) -> KeystoreResult<SigningKey> {
        let seed = self.load_seed(haxen_server_id)?;
        Ok(derive_signing_key(&seed, &root_path(haxen_server_id)))
    }

    fn root_jwk(&self, haxen_server_id: &str) -> KeystoreResult<PublicKeyJwk> {
        let key = self.root_key(haxen_server_id)?;
        Ok(jwk_for(&key))
    }
}

#[async_trait]
impl Keystore for LocalKeystore {
    async fn ensure_root(&self, haxen_server_id: &str) -> KeystoreResult<(PublicKeyJwk, KeyRef)> {
        if !self.seed_path(haxen_server_id).exists() {
            self.write_seed(haxen_server_id, false)?;
            info!(haxen_server_id, "created root key material");
        }
        Ok((self.root_jwk(haxen_server_id)?, KeyRef::root(haxen_server_id)))
    }

    async fn generate(&self, path: &DerivationPath) -> KeystoreResult<(PublicKeyJwk, KeyRef)> {
        let seed = self.load_seed(&path.haxen_server_id)?;
        let key = derive_signing_key(&seed, &path.render());
        let jwk = jwk_for(&key);

        let marker = self.marker_path(&path.haxen_server_id, path.index);
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent)?;
            restrict_to_owner(parent)?;
        }
        let serialized = serde_json::to_vec(&jwk)?;
        match write_restricted(&marker, &serialized, false) {
            Err(KeystoreError::PathCollision(_)) => {
                return Err(KeystoreError::PathCollision(path.render()));
            }
            other => other?,
        }

        debug!(path = %path, "derived key pair");
        Ok((jwk, KeyRef::child(path)))
    }

    async fn sign(&self, key_ref: &KeyRef, payload: &[u8]) -> KeystoreResult<Vec<u8>> {
        let key = match parse_key_ref(key_ref)? {
            ParsedRef::Root(server) => self.root_key(&server)?,
            ParsedRef::Child(server, index) => {
                if !self.marker_path(&server, index).exists() {
                    return Err(KeystoreError::KeyNotFound(key_ref.to_string()));
                }
                let seed = self.load_seed(&server)?;
                derive_signing_key(&seed, &DerivationPath::new(server, index).render())
            }
        };
        Ok(key.sign(payload).to_bytes().to_vec())
    }

    async fn rotate_root(&self, haxen_server_id: &str) -> KeystoreResult<(PublicKeyJwk, KeyRef)> {
        // Rotation requires an existing registry; a missing seed is a caller error.
        self.load_seed(haxen_server_id)?;
        self.write_seed(haxen_server_id, true)?;
        info!(haxen_server_id, "rotated root key material");
        Ok((self.root_jwk(haxen_server_id)?, KeyRef::root(haxen_server_id)))
    }

    async fn export_root_seed(&self, haxen_server_id: &str) -> KeystoreResult<Vec<u8>> {
        self.load_seed(haxen_server_id)
    }
}

enum ParsedRef {
    Root(String),
    Child(String, u64),
}

fn parse_key_ref(key_ref: &KeyRef) -> KeystoreResult<ParsedRef> {
    let parts: Vec<&str> = key_ref.as_str().split('/').collect();
    match parts.as_slice() {
        ["root", server] => Ok(ParsedRef::Root((*server).to_string())),
        ["child", server, index] => {
            let index = index
                .parse::<u64>()
                .map_err(|_| KeystoreError::KeyNotFound(key_ref.to_string()))?;
            Ok(ParsedRef::Child((*server).to_string(), index))
        }
        _ => Err(KeystoreError::KeyNotFound(key_ref.to_string())),
    }
}

fn root_path(haxen_server_id: &str) -> String {
    format!("m/haxen/{}/root", haxen_server_id)
}

fn derive_signing_key(seed: &[u8], rendered_path: &str) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(rendered_path.as_bytes());
    let bytes: [u8; 32] = hasher.finalize().into();
    SigningKey::from_bytes(&bytes)
}

fn jwk_for(key: &SigningKey) -> PublicKeyJwk {
    PublicKeyJwk::ed25519(URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()))
}

fn write_restricted(path: &Path, bytes: &[u8], overwrite: bool) -> KeystoreResult<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = match options.open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(KeystoreError::PathCollision(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> KeystoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> KeystoreResult<()> {
    Ok(())
}

#[cfg(unix)]
fn check_directory_access(path: &Path) -> KeystoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)
        .map_err(|e| KeystoreError::UnsafePath(format!("{}: {}", path.display(), e)))?;
    if !metadata.is_dir() {
        return Err(KeystoreError::UnsafePath(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    if metadata.permissions().mode() & 0o077 != 0 {
        return Err(KeystoreError::UnsafePath(format!(
            "{} is accessible by group or others",
            path.display()
        )));
    }
    fs::read_dir(path).map_err(|e| KeystoreError::UnsafePath(format!("{}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(not(unix))]
fn check_directory_access(path: &Path) -> KeystoreResult<()> {
    fs::read_dir(path).map_err(|e| KeystoreError::UnsafePath(format!("{}: {}", path.display(), e)))?;
    Ok(())
}
