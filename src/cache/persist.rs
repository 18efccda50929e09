//! Disk persistence for the response cache
//!
//! One JSON file per entry, named by the SHA-256 of the fingerprint. The
//! full fingerprint lives inside the file, so rehydration rebuilds exact
//! keys and prefix invalidation works on the in-memory map alone.
//!
//! Persistence is best effort end to end: a failed write costs a refetch
//! after restart, a torn or corrupt file is deleted and forgotten at load.
//! No request ever fails because of this module.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, warn};

/// One cache entry as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub fingerprint: String,
    pub status: u16,
    pub content_type: String,
    #[serde(with = "b64_bytes")]
    pub body: Bytes,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl PersistedEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.created_at + Duration::seconds(self.ttl_seconds as i64)
    }
}

/// File-per-entry store under one directory.
pub struct CachePersistence {
    dir: PathBuf,
}

impl CachePersistence {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        let digest = Sha256::digest(fingerprint.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    /// Write one entry. IO errors bubble up to the caller, which logs and
    /// moves on.
    pub async fn store(&self, record: &PersistedEntry) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec(record)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        tokio::fs::write(self.entry_path(&record.fingerprint), json).await
    }

    /// Remove one entry's file. A file that is already gone is fine.
    pub async fn remove(&self, fingerprint: &str) {
        let path = self.entry_path(fingerprint);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove persisted cache entry");
            }
        }
    }

    /// Load every live entry, deleting expired and unreadable files along
    /// the way.
    pub async fn load_all(&self) -> Vec<PersistedEntry> {
        let mut records = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return records,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Cannot read cache directory");
                return records;
            }
        };

        let now = Utc::now();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Error walking cache directory");
                    break;
                }
            };

            let path = entry.path();
            if path.extension().map(|ext| ext != "json").unwrap_or(true) {
                continue;
            }

            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read persisted cache entry");
                    continue;
                }
            };

            let record: PersistedEntry = match serde_json::from_slice(&raw) {
                Ok(record) => record,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Discarding corrupt cache file");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
            };

            if record.is_expired(now) {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }

            records.push(record);
        }

        records
    }
}

mod b64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64
            .decode(raw.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
