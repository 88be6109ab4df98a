//! Local file-based state storage backend.
//!
//! Each record lives in its own JSON file under `<base>/records/`, named by
//! the hex-encoded resource address (hashed when that gets too long). Writes go to a temporary file that is
//! synced and renamed over the target, so a record is never half-written.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StateError, StratumError};
use crate::graph::ResourceId;

use super::lock::{KeyedLocks, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::{StateStore, lock_lost, record_file_name, serial_matches};
use super::types::StateRecord;

/// Default state directory name.
pub const STATE_DIR: &str = ".stratum";

/// Record directory name.
const RECORDS_DIR: &str = "records";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Directory holding one file per record.
    records_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes compare-and-swap per record within this process.
    record_locks: KeyedLocks,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.stratum`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StratumError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let records_dir = base_dir.join(RECORDS_DIR);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            records_dir,
            lock_path,
            record_locks: KeyedLocks::new(),
        }
    }

    /// Base directory of the store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, id: &ResourceId) -> PathBuf {
        self.records_dir.join(record_file_name(id))
    }

    /// Ensures the record directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.records_dir.exists() {
            debug!("Creating state directory: {}", self.records_dir.display());
            fs::create_dir_all(&self.records_dir).await.map_err(|e| {
                StateError::storage(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    async fn read_record(path: &Path) -> Result<Option<StateRecord>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!(
                    "Failed to read record {}: {e}",
                    path.display()
                ))
                .into());
            }
        };

        let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse record {}: {e}", path.display()))
        })?;

        Ok(Some(record))
    }

    async fn write_record(&self, record: &StateRecord) -> Result<()> {
        self.ensure_dir().await?;

        let path = self.record_path(&record.id);
        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize record: {e}")))?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to create temp record file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write record file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync record file: {e}")))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename record file: {e}")))?;

        debug!(resource = %record.id, serial = record.serial, "Record saved");
        Ok(())
    }

    async fn remove_record(&self, id: &ResourceId) -> Result<()> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => {
                debug!(resource = %id, "Record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::storage(format!("Failed to delete record {id}: {e}")).into()),
        }
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Writes the lock file.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let lock_failed = |message: String| StratumError::State(StateError::LockFailed { message });

        let mut file = fs::File::create(&self.lock_path)
            .await
            .map_err(|e| lock_failed(format!("Failed to create lock file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed(format!("Failed to write lock file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| lock_failed(format!("Failed to sync lock file: {e}")))?;

        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                StratumError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        Self::read_record(&self.record_path(id)).await
    }

    async fn put(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        let _guard = self.record_locks.lock(&id.to_string()).await;
        self.write_record(record).await
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let _guard = self.record_locks.lock(&id.to_string()).await;
        self.remove_record(id).await
    }

    async fn compare_and_swap(
        &self,
        id: &ResourceId,
        expected: Option<u64>,
        new: Option<&StateRecord>,
    ) -> Result<bool> {
        let _guard = self.record_locks.lock(&id.to_string()).await;

        let current = Self::read_record(&self.record_path(id)).await?;
        if !serial_matches(current.as_ref(), expected) {
            debug!(
                resource = %id,
                ?expected,
                found = ?current.map(|r| r.serial),
                "Compare-and-swap rejected"
            );
            return Ok(false);
        }

        match new {
            Some(record) => self.write_record(record).await?,
            None => self.remove_record(id).await?,
        }
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<StateRecord>> {
        if !self.records_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.records_dir)
            .await
            .map_err(|e| StateError::storage(format!("Failed to read state directory: {e}")))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::storage(format!("Failed to read state directory: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(record) = Self::read_record(&path).await? {
                    records.push(record);
                }
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        info!(
            "Loaded {} record(s) from {}",
            records.len(),
            self.records_dir.display()
        );
        Ok(records)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        // Check for existing lock
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StratumError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            // Lock is expired, we can take it
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let existing = self
            .read_lock_file()
            .await?
            .filter(|l| l.lock_id == lock_id)
            .ok_or_else(|| lock_lost(lock_id))?;

        let renewed = existing.renewed();
        self.write_lock_file(&renewed).await?;
        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at);
        Ok(renewed)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttributeMap;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(id: ResourceId) -> StateRecord {
        StateRecord::pending(
            id,
            AttributeMap::from([(String::from("cidr"), json!("10.0.0.0/16"))]),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp) = create_test_store();
        let id = ResourceId::new(vec![String::from("net")], "network", "main");

        store.put(&id, &record(id.clone())).await.expect("Failed to save record");

        let loaded = store
            .get(&id)
            .await
            .expect("Failed to load record")
            .expect("Record should exist");
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.desired.get("cidr"), Some(&json!("10.0.0.0/16")));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store
            .get(&ResourceId::root("network", "main"))
            .await
            .expect("Load should not fail");
        assert!(result.is_none());
        assert!(store.list().await.expect("list failed").is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (store, _temp) = create_test_store();
        let id = ResourceId::root("network", "main");
        let marker = record(id.clone());

        assert!(store.compare_and_swap(&id, None, Some(&marker)).await.unwrap());
        assert!(!store.compare_and_swap(&id, None, Some(&marker)).await.unwrap());

        let confirmed = marker.confirm(AttributeMap::from([(
            String::from("id"),
            json!("network-1"),
        )]));
        assert!(store.compare_and_swap(&id, Some(1), Some(&confirmed)).await.unwrap());
        assert!(!store.compare_and_swap(&id, Some(1), None).await.unwrap());
        assert!(store.compare_and_swap(&id, Some(2), None).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (store, _temp) = create_test_store();
        let a = ResourceId::root("subnet", "a");
        let b = ResourceId::root("network", "main");

        store.put(&a, &record(a.clone())).await.unwrap();
        store.put(&b, &record(b.clone())).await.unwrap();

        let ids: Vec<ResourceId> = store.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.clone(), a.clone()]);

        store.delete(&a).await.unwrap();
        store.delete(&a).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_long_address_round_trips() {
        let (store, _temp) = create_test_store();
        let modules: Vec<String> = (0..10).map(|i| format!("platform_layer_{i}")).collect();
        let id = ResourceId::new(modules, "service", "api");
        assert!(id.to_string().len() > 127);

        store.put(&id, &record(id.clone())).await.expect("Failed to save record");
        assert_eq!(store.get(&id).await.unwrap().unwrap().id, id);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_renewal() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder-1").await.unwrap();

        let renewed = store.renew_lock(&lock.lock_id).await.unwrap();
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert!(renewed.expires_at >= lock.expires_at);

        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(matches!(
            store.renew_lock(&lock.lock_id).await,
            Err(StratumError::State(StateError::LockFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(StratumError::State(StateError::LockedByOther { .. }))
        ));
    }
}
