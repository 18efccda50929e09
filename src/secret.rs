//! Process secret management
//!
//! One 64-byte secret underpins everything stateful the gateway issues:
//! bearer tokens are signed with it and per-user credential keys are derived
//! from it. Sources, in priority order:
//!
//! 1. Explicit override (`USHER_SECRET`), for operator-managed rotation
//! 2. The persisted secret file under the data directory
//! 3. Freshly generated bytes, persisted atomically with owner-only permissions
//!
//! If the file cannot be written, the process keeps an in-memory secret and
//! runs degraded: sessions and stored credentials from this run die with the
//! process. That state is logged at startup and exposed through /health so
//! operators notice before users do.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info, warn};
use zeroize::Zeroize;

use crate::types::{Result, UsherError};

/// Secret length in bytes.
pub const SECRET_LEN: usize = 64;

/// Minimum accepted length for an override value, in bytes.
const MIN_OVERRIDE_LEN: usize = 32;

/// Serializes first-boot secret creation so two concurrent loads cannot
/// race each other into writing different files.
static BOOTSTRAP_LOCK: Mutex<()> = Mutex::new(());

/// Where the active secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    /// Operator-supplied override, file untouched
    Override,
    /// Read from the persisted secret file
    File,
    /// Generated this boot and persisted
    Generated,
    /// Generated this boot but could not be persisted (degraded)
    Memory,
}

impl SecretSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretSource::Override => "override",
            SecretSource::File => "file",
            SecretSource::Generated => "generated",
            SecretSource::Memory => "memory",
        }
    }
}

/// Stable process secret, resolved once at startup and shared for the
/// process lifetime.
pub struct SecretStore {
    secret: [u8; SECRET_LEN],
    source: SecretSource,
}

impl SecretStore {
    /// Resolve the process secret.
    ///
    /// Never fails on IO problems: a write failure degrades to an in-memory
    /// secret instead. The only hard error is an unusable override value,
    /// which is a configuration mistake the operator has to fix.
    pub fn load(override_value: Option<&str>, path: &Path) -> Result<Self> {
        if let Some(raw) = override_value {
            let secret = decode_override(raw)?;
            info!("Process secret loaded from override");
            return Ok(Self {
                secret,
                source: SecretSource::Override,
            });
        }

        let _guard = BOOTSTRAP_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Re-check under the lock: another thread may have just created it.
        if let Some(secret) = read_secret_file(path) {
            info!(path = %path.display(), "Process secret loaded from file");
            return Ok(Self {
                secret,
                source: SecretSource::File,
            });
        }

        let mut secret = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);

        match persist_secret(path, &secret) {
            Ok(()) => {
                info!(path = %path.display(), "Generated new process secret");
                Ok(Self {
                    secret,
                    source: SecretSource::Generated,
                })
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "Failed to persist process secret; continuing with an in-memory secret. \
                     Sessions and encrypted credentials from this run will NOT survive a restart"
                );
                Ok(Self {
                    secret,
                    source: SecretSource::Memory,
                })
            }
        }
    }

    /// The raw secret bytes.
    pub fn secret(&self) -> &[u8; SECRET_LEN] {
        &self.secret
    }

    /// True when the secret could not be persisted and everything issued
    /// this run is ephemeral.
    pub fn is_degraded(&self) -> bool {
        self.source == SecretSource::Memory
    }

    pub fn source(&self) -> SecretSource {
        self.source
    }
}

impl Drop for SecretStore {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Decode an operator-supplied override.
///
/// Accepts hex or base64 that decodes to exactly 64 bytes. Anything else of
/// sufficient length is stretched through SHA-512 so ad-hoc passphrases
/// still yield a full-width secret.
fn decode_override(raw: &str) -> Result<[u8; SECRET_LEN]> {
    let trimmed = raw.trim();

    if let Ok(bytes) = hex::decode(trimmed) {
        if bytes.len() == SECRET_LEN {
            let mut secret = [0u8; SECRET_LEN];
            secret.copy_from_slice(&bytes);
            return Ok(secret);
        }
    }

    {
        use base64::Engine;
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
            if bytes.len() == SECRET_LEN {
                let mut secret = [0u8; SECRET_LEN];
                secret.copy_from_slice(&bytes);
                return Ok(secret);
            }
        }
    }

    if trimmed.len() < MIN_OVERRIDE_LEN {
        return Err(UsherError::Internal(format!(
            "USHER_SECRET must be at least {} characters (or 64 bytes of hex/base64)",
            MIN_OVERRIDE_LEN
        )));
    }

    warn!("USHER_SECRET is not 64 bytes of hex or base64; deriving secret from it via SHA-512");
    let digest = Sha512::digest(trimmed.as_bytes());
    let mut secret = [0u8; SECRET_LEN];
    secret.copy_from_slice(&digest);
    Ok(secret)
}

/// Read and decode the persisted secret file.
///
/// A missing, empty, or malformed file returns None and the caller
/// regenerates. Malformed is loud: regeneration invalidates every session
/// and credential, so the operator should know it happened.
fn read_secret_file(path: &Path) -> Option<[u8; SECRET_LEN]> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Secret file unreadable; regenerating");
            return None;
        }
    };

    let trimmed = contents.trim();
    if trimmed.is_empty() {
        warn!(path = %path.display(), "Secret file is empty; regenerating");
        return None;
    }

    match hex::decode(trimmed) {
        Ok(bytes) if bytes.len() == SECRET_LEN => {
            let mut secret = [0u8; SECRET_LEN];
            secret.copy_from_slice(&bytes);
            Some(secret)
        }
        _ => {
            warn!(
                path = %path.display(),
                "Secret file is malformed; regenerating. Existing sessions and credentials are now invalid"
            );
            None
        }
    }
}

/// Write the secret as hex, atomically, with owner-only permissions.
///
/// The temp file gets its permissions restricted before any secret bytes are
/// written, then replaces the target via rename.
fn persist_secret(path: &Path, secret: &[u8; SECRET_LEN]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension("key.tmp");
    let mut file = fs::File::create(&tmp)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    let mut encoded = hex::encode(secret);
    let result = file
        .write_all(encoded.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all());
    encoded.zeroize();
    drop(file);

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("usher-secret-test-{}", uuid::Uuid::new_v4()))
            .join("secret.key")
    }

    #[test]
    fn test_generates_and_persists() {
        let path = temp_path();
        let store = SecretStore::load(None, &path).unwrap();
        assert_eq!(store.source(), SecretSource::Generated);
        assert!(!store.is_degraded());
        assert!(path.exists());

        // File content is hex of the in-memory secret
        let on_disk = fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk.trim(), hex::encode(store.secret()));
    }

    #[test]
    fn test_reload_returns_same_secret() {
        let path = temp_path();
        let first = SecretStore::load(None, &path).unwrap();
        let second = SecretStore::load(None, &path).unwrap();
        assert_eq!(second.source(), SecretSource::File);
        assert_eq!(first.secret(), second.secret());
    }

    #[test]
    fn test_override_wins_and_skips_file() {
        let path = temp_path();
        let value = hex::encode([7u8; SECRET_LEN]);
        let store = SecretStore::load(Some(&value), &path).unwrap();
        assert_eq!(store.source(), SecretSource::Override);
        assert_eq!(store.secret(), &[7u8; SECRET_LEN]);
        assert!(!path.exists());
    }

    #[test]
    fn test_override_base64() {
        use base64::Engine;
        let path = temp_path();
        let value = base64::engine::general_purpose::STANDARD.encode([9u8; SECRET_LEN]);
        let store = SecretStore::load(Some(&value), &path).unwrap();
        assert_eq!(store.secret(), &[9u8; SECRET_LEN]);
    }

    #[test]
    fn test_override_passphrase_is_stretched() {
        let path = temp_path();
        let phrase = "correct horse battery staple correct horse battery staple";
        let a = SecretStore::load(Some(phrase), &path).unwrap();
        let b = SecretStore::load(Some(phrase), &path).unwrap();
        assert_eq!(a.secret(), b.secret());
        assert_ne!(a.secret(), &[0u8; SECRET_LEN]);
    }

    #[test]
    fn test_short_override_rejected() {
        let path = temp_path();
        assert!(SecretStore::load(Some("too short"), &path).is_err());
    }

    #[test]
    fn test_malformed_file_regenerated() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not hex at all").unwrap();

        let store = SecretStore::load(None, &path).unwrap();
        assert_eq!(store.source(), SecretSource::Generated);

        // The malformed file was replaced with a valid one
        let reloaded = SecretStore::load(None, &path).unwrap();
        assert_eq!(reloaded.source(), SecretSource::File);
        assert_eq!(store.secret(), reloaded.secret());
    }

    #[test]
    fn test_degraded_when_unwritable() {
        // Parent "directory" is a regular file, so persisting must fail
        let base = std::env::temp_dir().join(format!("usher-secret-test-{}", uuid::Uuid::new_v4()));
        fs::write(&base, "occupied").unwrap();
        let path = base.join("secret.key");

        let store = SecretStore::load(None, &path).unwrap();
        assert_eq!(store.source(), SecretSource::Memory);
        assert!(store.is_degraded());
        assert_eq!(store.secret().len(), SECRET_LEN);
    }

    #[test]
    fn test_concurrent_bootstrap_creates_one_file() {
        let path = temp_path();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                SecretStore::load(None, &path).map(|s| *s.secret())
            }));
        }

        let secrets: Vec<[u8; SECRET_LEN]> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        // Every load observed the same secret, and disk agrees
        for s in &secrets {
            assert_eq!(s, &secrets[0]);
        }
        let on_disk = fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk.trim(), hex::encode(secrets[0]));

        // No stray temp file left behind
        assert!(!path.with_extension("key.tmp").exists());
    }
}
