//! # Key Store
//!
//! Persisted credentials as PKCS#8 PEM files in a single directory.
//!
//! Iteration order is stable within a handshake attempt: most recently
//! modified first, so the key that worked last time is offered first. Files
//! that fail to decode are skipped with a warning rather than aborting the
//! handshake — a corrupt key must not lock the user out of the bootstrap
//! path.

use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::{constants, BridgeError, Result};

/// Directory-backed credential store.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
    key_name: String,
}

impl KeyStore {
    /// Open (creating if necessary) the store at `dir`. `key_name` is the
    /// human-readable name attached to credentials loaded from or saved to
    /// this store.
    pub fn open(dir: impl Into<PathBuf>, key_name: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            BridgeError::KeyStore(format!("{}: {e}", constants::ERR_KEY_DIR))
        })?;
        Ok(Self {
            dir,
            key_name: key_name.into(),
        })
    }

    /// Load all stored credentials, most recently modified first.
    ///
    /// The returned sequence is finite and recomputed per call, so each
    /// handshake attempt restarts iteration from the top.
    pub fn iterate(&self) -> Result<Vec<super::Credential>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            BridgeError::KeyStore(format!("{}: {e}", constants::ERR_KEY_DIR))
        })?;

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            files.push((mtime, path));
        }
        files.sort_by(|a, b| b.0.cmp(&a.0));

        let mut credentials = Vec::with_capacity(files.len());
        for (_, path) in files {
            match self.load_one(&path) {
                Ok(credential) => credentials.push(credential),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping undecodable key file");
                }
            }
        }
        debug!(count = credentials.len(), dir = %self.dir.display(), "loaded stored credentials");
        Ok(credentials)
    }

    fn load_one(&self, path: &Path) -> Result<super::Credential> {
        let pem = fs::read_to_string(path)
            .map_err(|e| BridgeError::KeyStore(format!("{}: {e}", constants::ERR_KEY_DECODE)))?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| BridgeError::KeyStore(format!("{}: {e}", constants::ERR_KEY_DECODE)))?;
        Ok(super::Credential::new(key, self.key_name.clone()))
    }

    /// Persist a credential as a new PEM file and return its path.
    ///
    /// Called only after the credential's public key was successfully sent to
    /// the peer, so the store never accumulates keys no device has seen.
    pub fn persist(&self, credential: &super::Credential) -> Result<PathBuf> {
        let pem = credential
            .private_key()
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| BridgeError::KeyStore(format!("failed to encode key: {e}")))?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut path = self.dir.join(format!("bridgekey-{stamp}.pem"));
        let mut counter = 0u32;
        while path.exists() {
            counter += 1;
            path = self.dir.join(format!("bridgekey-{stamp}-{counter}.pem"));
        }

        fs::write(&path, pem.as_bytes())
            .map_err(|e| BridgeError::KeyStore(format!("failed to write key file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
        }

        debug!(path = %path.display(), "persisted new credential");
        Ok(path)
    }

    /// The name attached to credentials from this store.
    pub fn key_name(&self) -> &str {
        &self.key_name
    }
}
