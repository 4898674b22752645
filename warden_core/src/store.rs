//! The Durable Store - domain-object-keyed protections that survive restarts.
//!
//! The store keeps an in-memory mirror of the whole table. Mutations touch
//! only the mirror and raise a dirty flag; a single serialized writer
//! rewrites the backend later (see `flush`), so a burst of N mutations
//! produces one write.
//!
//! Record shape on disk:
//!
//! ```text
//! { "records": { "<domainObjectId>": { "expireAtMs": 1700000000000, "owner": "<actorId>|" } } }
//! ```

use crate::config::{StoreBackendKind, StoreConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};
use warden_env::{ActorId, DomainObjectId};

/// Durable store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Storage error: {0}")]
    Backend(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One persisted protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedProtection {
    pub expire_at_ms: i64,
    pub owner: Option<ActorId>,
}

/// The full persisted table.
pub type ProtectionTable = BTreeMap<DomainObjectId, PersistedProtection>;

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct RecordWire {
    #[serde(rename = "expireAtMs", default)]
    expire_at_ms: i64,

    /// Empty string means "no owner"
    #[serde(default)]
    owner: String,
}

impl RecordWire {
    fn from_record(rec: &PersistedProtection) -> Self {
        Self {
            expire_at_ms: rec.expire_at_ms,
            owner: rec.owner.map(|o| o.to_string()).unwrap_or_default(),
        }
    }

    fn into_record(self) -> PersistedProtection {
        // A malformed owner degrades to public protection, never to no protection
        let owner = if self.owner.trim().is_empty() {
            None
        } else {
            self.owner.parse().ok()
        };
        PersistedProtection {
            expire_at_ms: self.expire_at_ms,
            owner,
        }
    }
}

/// Decode one `(key, value)` pair, skipping the record if either is malformed.
fn decode_entry(key: &str, value: serde_json::Value) -> Option<(DomainObjectId, PersistedProtection)> {
    let id = match key.parse::<DomainObjectId>() {
        Ok(id) => id,
        Err(e) => {
            warn!("Skipping persisted protection with bad id: {}", e);
            return None;
        }
    };
    match serde_json::from_value::<RecordWire>(value) {
        Ok(wire) => Some((id, wire.into_record())),
        Err(e) => {
            warn!("Skipping malformed persisted protection {}: {}", id, e);
            None
        }
    }
}

/// Decode a whole file image. A missing or non-object `records` section
/// yields an empty table.
fn decode_image(text: &str) -> Result<ProtectionTable, StoreError> {
    let root: serde_json::Value =
        serde_json::from_str(text).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let mut table = ProtectionTable::new();
    if let Some(serde_json::Value::Object(records)) = root.get("records").cloned() {
        for (key, value) in records {
            if let Some((id, rec)) = decode_entry(&key, value) {
                table.insert(id, rec);
            }
        }
    }
    Ok(table)
}

fn encode_image(table: &ProtectionTable) -> Result<Vec<u8>, StoreError> {
    let records: BTreeMap<String, RecordWire> = table
        .iter()
        .map(|(id, rec)| (id.to_string(), RecordWire::from_record(rec)))
        .collect();
    let root = serde_json::json!({ "records": records });
    serde_json::to_vec_pretty(&root).map_err(|e| StoreError::Backend(e.to_string()))
}

// ============================================================================
// BACKENDS
// ============================================================================

/// Where the table is physically kept.
///
/// Implementations must be thread-safe. `save` receives the complete table
/// and replaces whatever was stored before.
pub trait StoreBackend: Send + Sync {
    /// Load the complete table. A missing store is an empty table.
    fn load(&self) -> Result<ProtectionTable, StoreError>;

    /// Replace the stored table.
    fn save(&self, table: &ProtectionTable) -> Result<(), StoreError>;
}

/// Flat JSON file, rewritten via temp file + rename.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreBackend for JsonFileBackend {
    fn load(&self) -> Result<ProtectionTable, StoreError> {
        if !self.path.exists() {
            return Ok(ProtectionTable::new());
        }
        let text = std::fs::read_to_string(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        decode_image(&text)
    }

    fn save(&self, table: &ProtectionTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }
        let bytes = encode_image(table)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }
}

/// Sled-based backend.
///
/// Keys are domain object ids as strings, values the JSON record.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Backend(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Create a temporary store (for testing and simulation)
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Backend(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }
}

impl StoreBackend for SledBackend {
    fn load(&self) -> Result<ProtectionTable, StoreError> {
        let mut table = ProtectionTable::new();
        for result in self.db.iter() {
            let (key, value) = result
                .map_err(|e| StoreError::Backend(format!("Iteration failed: {}", e)))?;
            let key = String::from_utf8_lossy(&key);
            let value: serde_json::Value = match serde_json::from_slice(&value) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Skipping unreadable sled record {}: {}", key, e);
                    continue;
                }
            };
            if let Some((id, rec)) = decode_entry(&key, value) {
                table.insert(id, rec);
            }
        }
        Ok(table)
    }

    fn save(&self, table: &ProtectionTable) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for result in self.db.iter().keys() {
            let key = result.map_err(|e| StoreError::Backend(format!("Iteration failed: {}", e)))?;
            let keep = std::str::from_utf8(&key)
                .ok()
                .and_then(|k| k.parse::<DomainObjectId>().ok())
                .map(|id| table.contains_key(&id))
                .unwrap_or(false);
            if !keep {
                batch.remove(key);
            }
        }
        for (id, rec) in table {
            let value = serde_json::to_vec(&RecordWire::from_record(rec))
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            batch.insert(id.to_string().as_bytes(), value);
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| StoreError::Backend(format!("Batch failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

// ============================================================================
// DURABLE STORE
// ============================================================================

/// Cached, lazily loaded view of a backend with coalesced writes.
pub struct DurableStore {
    backend: Box<dyn StoreBackend>,

    /// In-memory mirror, `None` until first access
    mirror: parking_lot::RwLock<Option<ProtectionTable>>,

    /// Set by every mutation, cleared by the writer
    dirty: AtomicBool,

    /// One permit per pending flush; extra notifications coalesce
    pending: Notify,

    /// Serializes backend writes
    writer: parking_lot::Mutex<()>,

    /// Number of completed backend writes
    writes: AtomicU64,
}

impl DurableStore {
    pub fn new(backend: Box<dyn StoreBackend>) -> Self {
        Self {
            backend,
            mirror: parking_lot::RwLock::new(None),
            dirty: AtomicBool::new(false),
            pending: Notify::new(),
            writer: parking_lot::Mutex::new(()),
            writes: AtomicU64::new(0),
        }
    }

    /// Convenience: JSON file store.
    pub fn json_file<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(Box::new(JsonFileBackend::new(path)))
    }

    /// Open the backend selected by configuration.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let backend: Box<dyn StoreBackend> = match config.backend {
            StoreBackendKind::JsonFile => Box::new(JsonFileBackend::new(config.path.clone())),
            StoreBackendKind::Sled => Box::new(SledBackend::open(&config.path)?),
        };
        Ok(Self::new(backend))
    }

    fn ensure_loaded(&self) {
        if self.mirror.read().is_some() {
            return;
        }
        let mut guard = self.mirror.write();
        if guard.is_some() {
            return;
        }
        let table = match self.backend.load() {
            Ok(table) => {
                debug!("Loaded {} persisted protections", table.len());
                table
            }
            Err(e) => {
                // Self-heals on the next successful write
                warn!("Protection store unreadable, starting empty: {}", e);
                ProtectionTable::new()
            }
        };
        *guard = Some(table);
    }

    /// Snapshot of every persisted record.
    pub fn records(&self) -> Vec<(DomainObjectId, PersistedProtection)> {
        self.ensure_loaded();
        self.mirror
            .read()
            .as_ref()
            .map(|t| t.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &DomainObjectId) -> Option<PersistedProtection> {
        self.ensure_loaded();
        self.mirror.read().as_ref().and_then(|t| t.get(id).copied())
    }

    pub fn contains(&self, id: &DomainObjectId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.ensure_loaded();
        self.mirror.read().as_ref().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a record. The write is deferred.
    pub fn upsert(&self, id: DomainObjectId, record: PersistedProtection) {
        self.ensure_loaded();
        if let Some(table) = self.mirror.write().as_mut() {
            table.insert(id, record);
        }
        self.mark_dirty();
    }

    /// Remove a record. Returns true if it existed. The write is deferred.
    pub fn remove(&self, id: &DomainObjectId) -> bool {
        self.ensure_loaded();
        let removed = self
            .mirror
            .write()
            .as_mut()
            .map(|t| t.remove(id).is_some())
            .unwrap_or(false);
        if removed {
            self.mark_dirty();
        }
        removed
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.pending.notify_one();
    }

    /// True if the mirror has changes not yet written.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Resolves when a mutation has happened since the last wake-up.
    pub async fn wait_dirty(&self) {
        self.pending.notified().await;
    }

    /// Write the mirror to the backend if dirty.
    ///
    /// Returns `Ok(true)` if a write happened. On failure the dirty flag is
    /// restored so the next flush retries.
    pub fn flush(&self) -> Result<bool, StoreError> {
        let _writer = self.writer.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let snapshot = self.mirror.read().clone().unwrap_or_default();
        match self.backend.save(&snapshot) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                debug!("Flushed {} protections", snapshot.len());
                Ok(true)
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Number of completed backend writes since construction.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(expire_at_ms: i64, owner: Option<ActorId>) -> PersistedProtection {
        PersistedProtection { expire_at_ms, owner }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::json_file(dir.path().join("protection-cache.json"));
        assert!(store.is_empty());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("protection-cache.json");
        let a = DomainObjectId::from_seed(1);
        let b = DomainObjectId::from_seed(2);
        let owner = ActorId::from_seed(9);

        let store = DurableStore::json_file(&path);
        store.upsert(a, rec(1_000, Some(owner)));
        store.upsert(b, rec(2_000, None));
        assert!(store.flush().unwrap());

        let reopened = DurableStore::json_file(&path);
        assert_eq!(reopened.get(&a), Some(rec(1_000, Some(owner))));
        assert_eq!(reopened.get(&b), Some(rec(2_000, None)));
    }

    #[test]
    fn test_owner_written_as_empty_string_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protection-cache.json");
        let id = DomainObjectId::from_seed(1);

        let store = DurableStore::json_file(&path);
        store.upsert(id, rec(5, None));
        store.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let root: serde_json::Value = serde_json::from_str(&text).unwrap();
        let entry = &root["records"][id.to_string()];
        assert_eq!(entry["expireAtMs"], 5);
        assert_eq!(entry["owner"], "");
    }

    #[test]
    fn test_corrupt_file_yields_empty_table_and_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protection-cache.json");
        std::fs::write(&path, "{{{{ definitely not json").unwrap();

        let store = DurableStore::json_file(&path);
        assert!(store.is_empty());

        let id = DomainObjectId::from_seed(4);
        store.upsert(id, rec(10, None));
        store.flush().unwrap();

        let reopened = DurableStore::json_file(&path);
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_malformed_record_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protection-cache.json");
        let good = DomainObjectId::from_seed(1);
        let text = format!(
            r#"{{ "records": {{
                "not-a-uuid": {{ "expireAtMs": 10, "owner": "" }},
                "{good}": {{ "expireAtMs": 20, "owner": "also-not-a-uuid" }},
                "{bad_shape}": "oops"
            }} }}"#,
            good = good,
            bad_shape = DomainObjectId::from_seed(2),
        );
        std::fs::write(&path, text).unwrap();

        let store = DurableStore::json_file(&path);
        assert_eq!(store.len(), 1);
        // Unparsable owner degrades to public protection
        assert_eq!(store.get(&good), Some(rec(20, None)));
    }

    #[test]
    fn test_missing_records_section_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protection-cache.json");
        std::fs::write(&path, r#"{ "other": 1 }"#).unwrap();
        assert!(DurableStore::json_file(&path).is_empty());
    }

    #[test]
    fn test_rapid_mutations_coalesce_into_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::json_file(dir.path().join("protection-cache.json"));

        for i in 0..100 {
            store.upsert(DomainObjectId::from_seed(i), rec(i as i64, None));
        }
        assert!(store.flush().unwrap());
        assert!(!store.flush().unwrap());
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_remove_of_absent_record_does_not_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::json_file(dir.path().join("protection-cache.json"));
        assert!(!store.remove(&DomainObjectId::from_seed(1)));
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_sled_backend_replaces_table() {
        let backend = SledBackend::open_temporary().unwrap();
        let a = DomainObjectId::from_seed(1);
        let b = DomainObjectId::from_seed(2);

        let mut table = ProtectionTable::new();
        table.insert(a, rec(1, None));
        table.insert(b, rec(2, Some(ActorId::from_seed(3))));
        backend.save(&table).unwrap();

        table.remove(&a);
        backend.save(&table).unwrap();

        let loaded = backend.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&b), Some(&rec(2, Some(ActorId::from_seed(3)))));
    }
}
