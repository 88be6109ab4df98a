//! In-memory state storage backend.
//!
//! Used by tests and dry runs. Nothing survives the process.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::lock::{LockInfo, generate_holder_id};
use super::store::{StateStore, lock_lost, serial_matches};
use super::types::StateRecord;
use crate::error::{Result, StateError, StratumError};
use crate::graph::ResourceId;

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<BTreeMap<ResourceId, StateRecord>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the given records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
            lock: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        self.records.write().await.insert(id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        id: &ResourceId,
        expected: Option<u64>,
        new: Option<&StateRecord>,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        if !serial_matches(records.get(id), expected) {
            debug!(resource = %id, ?expected, "Compare-and-swap rejected");
            return Ok(false);
        }

        match new {
            Some(record) => {
                records.insert(id.clone(), record.clone());
            }
            None => {
                records.remove(id);
            }
        }
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<StateRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;
        if let Some(existing) = lock.as_ref() {
            if !existing.is_expired() {
                return Err(StratumError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let info = LockInfo::new(&holder_id);
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.lock().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;
        let held = lock
            .as_ref()
            .filter(|l| l.lock_id == lock_id)
            .ok_or_else(|| lock_lost(lock_id))?;
        let renewed = held.renewed();
        *lock = Some(renewed.clone());
        Ok(renewed)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .lock
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
