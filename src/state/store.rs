//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::lock::LockInfo;
use super::types::StateRecord;
use crate::error::{Result, StateError, StratumError};
use crate::graph::ResourceId;

/// Trait for state storage backends.
///
/// Records are keyed by resource address. Writes during a run go through
/// [`StateStore::compare_and_swap`] so a step never overwrites a record it
/// did not read.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads one record. Returns `None` if the resource has no record.
    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>>;

    /// Writes a record unconditionally.
    async fn put(&self, id: &ResourceId, record: &StateRecord) -> Result<()>;

    /// Deletes a record unconditionally. Deleting a missing record is not an error.
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    /// Replaces the record only if its serial matches `expected`.
    ///
    /// `expected = None` requires that no record exists; `new = None` deletes
    /// the record. Returns false without writing if the check fails.
    async fn compare_and_swap(
        &self,
        id: &ResourceId,
        expected: Option<u64>,
        new: Option<&StateRecord>,
    ) -> Result<bool>;

    /// Loads every record, ordered by resource address.
    async fn list(&self) -> Result<Vec<StateRecord>>;

    /// Acquires the run lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the run lock.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Pushes back the expiry of the run lock held under `lock_id`.
    ///
    /// Fails with `LockFailed` if that lock is no longer held.
    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        (**self).get(id).await
    }

    async fn put(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        (**self).put(id, record).await
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        (**self).delete(id).await
    }

    async fn compare_and_swap(
        &self,
        id: &ResourceId,
        expected: Option<u64>,
        new: Option<&StateRecord>,
    ) -> Result<bool> {
        (**self).compare_and_swap(id, expected, new).await
    }

    async fn list(&self) -> Result<Vec<StateRecord>> {
        (**self).list().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).renew_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Checks a compare-and-swap expectation against the current record.
#[must_use]
pub fn serial_matches(current: Option<&StateRecord>, expected: Option<u64>) -> bool {
    current.map(|r| r.serial) == expected
}

/// Longest hex-encoded address used as a record file name as is.
const MAX_ENCODED_LEN: usize = 200;

/// File name of a record: the hex-encoded address, or its SHA-256 when the
/// encoding would exceed common file name limits.
#[must_use]
pub fn record_file_name(id: &ResourceId) -> String {
    let address = id.to_string();
    let encoded = hex::encode(&address);
    if encoded.len() <= MAX_ENCODED_LEN {
        format!("{encoded}.json")
    } else {
        format!("sha256-{}.json", hex::encode(Sha256::digest(address.as_bytes())))
    }
}

/// Error for a lock that is no longer held under the expected id.
pub(super) fn lock_lost(lock_id: &str) -> StratumError {
    StateError::LockFailed {
        message: format!("lock {lock_id} is no longer held"),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_file_name_short_and_long() {
        let short = ResourceId::root("network", "main");
        assert_eq!(record_file_name(&short), format!("{}.json", hex::encode("network.main")));

        let modules: Vec<String> = (0..12).map(|i| format!("component_{i}")).collect();
        let long = ResourceId::new(modules.clone(), "service", "api");
        let name = record_file_name(&long);
        assert!(name.starts_with("sha256-"));
        assert_eq!(name.len(), "sha256-".len() + 64 + ".json".len());

        let other = ResourceId::new(modules, "service", "web");
        assert_ne!(record_file_name(&other), name);
    }
}
