//! Standardized on-disk layout for a Haxen installation.
//!
//! Every service resolves its data locations through [`HaxenDirs`] so that one
//! installation (one `HAXEN_HOME`) maps to exactly one control-plane identity.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// The standardized data directories for one Haxen installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaxenDirs {
    pub home: PathBuf,
    pub data: PathBuf,
    pub keys: PathBuf,
    pub did_registries: PathBuf,
    pub vcs_executions: PathBuf,
    pub vcs_workflows: PathBuf,
    pub logs: PathBuf,
    pub config: PathBuf,
}

impl HaxenDirs {
    /// Resolve the installation home: `HAXEN_HOME` if set, else `~/.haxen`.
    pub fn default_home() -> PathBuf {
        if let Ok(home) = env::var("HAXEN_HOME") {
            if !home.is_empty() {
                return PathBuf::from(home);
            }
        }
        let user_home = env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
        user_home.join(".haxen")
    }

    /// Lay out the directory structure rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let data = home.join("data");
        Self {
            keys: data.join("keys"),
            did_registries: data.join("did_registries"),
            vcs_executions: data.join("vcs").join("executions"),
            vcs_workflows: data.join("vcs").join("workflows"),
            logs: home.join("logs"),
            config: home.join("config"),
            data,
            home,
        }
    }

    /// Path to the main control-plane database.
    pub fn database_path(&self) -> PathBuf {
        self.data.join("haxen.db")
    }

    /// Create every directory, tightening the sensitive ones (key material and
    /// DID registries) to owner-only access.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            &self.home,
            &self.data,
            &self.keys,
            &self.did_registries,
            &self.vcs_executions,
            &self.vcs_workflows,
            &self.logs,
            &self.config,
        ] {
            fs::create_dir_all(dir)?;
        }
        for sensitive in [&self.keys, &self.did_registries] {
            restrict_to_owner(sensitive)?;
        }
        Ok(())
    }
}

/// Deterministic haxen server ID for an installation path: the first 16 hex
/// characters of the SHA-256 of the absolute path. Unique per installation,
/// stable across restarts.
pub fn haxen_server_id_for(home: &Path) -> String {
    let absolute = home
        .canonicalize()
        .unwrap_or_else(|_| home.to_path_buf());
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> io::Result<()> {
    Ok(())
}
