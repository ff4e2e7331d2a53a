//! Shared persistent dedup markers.
//!
//! Keys are namespaced strings: `seen:<message_id>` marks a message as
//! handled, `claim:<message_id>:<instance_id>` records a pending claim when no
//! broadcast bus is available. Stores are advisory: every caller must survive
//! a store that errors.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use courier_proto::MessageId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{NotifyError, Result};

/// Key of the handled-marker for `id`.
pub fn seen_key(id: &MessageId) -> String {
    format!("seen:{}", id)
}

/// Prefix shared by every claim record for `id`.
pub fn claim_prefix(id: &MessageId) -> String {
    format!("claim:{}:", id)
}

/// Key of `instance`'s claim record for `id`.
pub fn claim_key(id: &MessageId, instance: &str) -> String {
    format!("{}{}", claim_prefix(id), instance)
}

/// A stored marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    /// Instance that wrote the marker.
    pub owner: String,
    /// Write time in epoch milliseconds.
    pub written_at_ms: u64,
    /// Expiry in epoch milliseconds (exclusive).
    pub expires_at_ms: u64,
}

impl MarkerRecord {
    /// Whether the marker still counts at `now_ms`.
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Key-value store for markers, shared between instances.
pub trait MarkerStore: Send + Sync {
    /// Reads one marker, expired or not.
    fn get(&self, key: &str) -> Result<Option<MarkerRecord>>;
    /// Writes or replaces a marker.
    fn put(&self, key: &str, record: &MarkerRecord) -> Result<()>;
    /// Deletes a marker. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool>;
    /// Every marker whose key starts with `prefix`.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, MarkerRecord)>>;
    /// Deletes markers expired at `now_ms`. Returns how many were deleted.
    fn purge_expired(&self, now_ms: u64) -> Result<usize>;
}

/// In-memory store. Clones share the same map, so several coordinators in one
/// process can share it.
#[derive(Clone, Default)]
pub struct MemoryMarkerStore {
    records: Arc<Mutex<HashMap<String, MarkerRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryMarkerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail until cleared, to exercise degraded paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored markers.
    pub fn len(&self) -> usize {
        self.records.lock().expect("lock poisoned").len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NotifyError::StorageUnavailable(
                "memory store disabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn get(&self, key: &str) -> Result<Option<MarkerRecord>> {
        self.check()?;
        Ok(self.records.lock().expect("lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &str, record: &MarkerRecord) -> Result<()> {
        self.check()?;
        self.records
            .lock()
            .expect("lock poisoned")
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .records
            .lock()
            .expect("lock poisoned")
            .remove(key)
            .is_some())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, MarkerRecord)>> {
        self.check()?;
        let records = self.records.lock().expect("lock poisoned");
        let mut out: Vec<_> = records
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize> {
        self.check()?;
        let mut records = self.records.lock().expect("lock poisoned");
        let before = records.len();
        records.retain(|_, r| r.is_live(now_ms));
        Ok(before - records.len())
    }
}

/// Directory-backed store: one JSON file per key, visible to every process
/// that opens the same directory.
///
/// File names are the URL-safe base64 of the key. Keys whose encoding would
/// exceed [`MAX_ENCODED_NAME`] are named by their SHA-256 instead; every file
/// also carries its key, so scans resolve both kinds. Writes go through a
/// temporary file and a rename.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    dir: PathBuf,
}

const MARKER_EXT: &str = "marker";
const HASHED_EXT: &str = "hmarker";

/// Longest base64 file stem used before switching to a hashed name. Leaves
/// headroom under the common 255-byte file name limit.
pub const MAX_ENCODED_NAME: usize = 200;

#[derive(Serialize, Deserialize)]
struct StoredMarker {
    key: String,
    #[serde(flatten)]
    record: MarkerRecord,
}

impl FileMarkerStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "opened file marker store");
        Ok(Self { dir })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(key);
        if encoded.len() <= MAX_ENCODED_NAME {
            return self.dir.join(format!("{}.{}", encoded, MARKER_EXT));
        }
        let digest = Sha256::digest(key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.{}", hex, HASHED_EXT))
    }

    /// Key encoded in the file name; `Some(None)` for hashed names, whose key
    /// lives only in the file body.
    fn key_for(path: &Path) -> Option<Option<String>> {
        let ext = path.extension()?;
        if ext == HASHED_EXT {
            return Some(None);
        }
        if ext != MARKER_EXT {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
        String::from_utf8(bytes).ok().map(Some)
    }

    fn read(path: &Path) -> Result<Option<StoredMarker>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn entries(&self) -> Result<Vec<(Option<String>, PathBuf)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(key) = Self::key_for(&path) {
                out.push((key, path));
            }
        }
        Ok(out)
    }
}

impl MarkerStore for FileMarkerStore {
    fn get(&self, key: &str) -> Result<Option<MarkerRecord>> {
        Ok(Self::read(&self.path_for(key))?
            .filter(|stored| stored.key == key)
            .map(|stored| stored.record))
    }

    fn put(&self, key: &str, record: &MarkerRecord) -> Result<()> {
        let path = self.path_for(key);
        let body = serde_json::to_vec(&StoredMarker {
            key: key.to_string(),
            record: record.clone(),
        })?;
        let tmp = self
            .dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, body)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, MarkerRecord)>> {
        let mut out = Vec::new();
        for (name_key, path) in self.entries()? {
            if matches!(&name_key, Some(key) if !key.starts_with(prefix)) {
                continue;
            }
            match Self::read(&path) {
                Ok(Some(stored)) if stored.key.starts_with(prefix) => {
                    out.push((stored.key, stored.record))
                }
                Ok(_) => {}
                // A half-written or foreign file must not hide the others.
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable marker"),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize> {
        let mut purged = 0;
        for (_, path) in self.entries()? {
            let expired = match Self::read(&path) {
                Ok(Some(stored)) => !stored.record.is_live(now_ms),
                Ok(None) => false,
                Err(_) => true,
            };
            if !expired {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(purged)
    }
}
