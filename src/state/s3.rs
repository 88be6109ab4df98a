//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) for shared stacks. Each record is one object under
//! `<prefix>records/`; compare-and-swap uses S3 conditional writes
//! (`If-None-Match: *` for creates, `If-Match: <etag>` for replacements).

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info};

use crate::error::{Result, StateError, StratumError};
use crate::graph::ResourceId;

use super::lock::{KeyedLocks, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::{StateStore, lock_lost, record_file_name};
use super::types::StateRecord;

/// Record key directory.
const RECORDS_KEY: &str = "records/";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3 error codes returned when a conditional write loses.
const PRECONDITION_CODES: [&str; 2] = ["PreconditionFailed", "ConditionalRequestConflict"];

/// Write condition for a put.
enum Condition<'a> {
    None,
    Absent,
    ETag(&'a str),
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Serializes compare-and-swap per record within this process.
    record_locks: KeyedLocks,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            record_locks: KeyedLocks::new(),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    fn record_key(&self, id: &ResourceId) -> String {
        self.key(&format!("{RECORDS_KEY}{}", record_file_name(id)))
    }

    /// Gets an object and its entity tag.
    async fn get_object(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object. Returns false if the write condition failed.
    async fn put_object(&self, key: &str, content: &str, condition: Condition<'_>) -> Result<bool> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");

        request = match condition {
            Condition::None => request,
            Condition::Absent => request.if_none_match("*"),
            Condition::ETag(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let code = sdk_err
                    .as_service_error()
                    .and_then(ProvideErrorMetadata::code)
                    .map(str::to_string);
                if code.as_deref().is_some_and(|c| PRECONDITION_CODES.contains(&c)) {
                    debug!("Conditional write to {key} lost");
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 put error: {sdk_err}")).into())
                }
            }
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    async fn get_record(&self, id: &ResourceId) -> Result<Option<(StateRecord, Option<String>)>> {
        let Some((content, etag)) = self.get_object(&self.record_key(id)).await? else {
            return Ok(None);
        };
        let record = parse_record(&content)?;
        Ok(Some((record, etag)))
    }

    async fn read_lock(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some((content, etag)) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
        Ok(Some((lock, etag)))
    }
}

fn parse_record(content: &str) -> Result<StateRecord> {
    serde_json::from_str(content)
        .map_err(|e| StateError::corrupted(format!("Failed to parse record: {e}")).into())
}

fn serialize<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StateError::serialization(format!("Failed to serialize: {e}")).into())
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        debug!("Loading record {id} from s3://{}", self.bucket);
        Ok(self.get_record(id).await?.map(|(record, _)| record))
    }

    async fn put(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        let _guard = self.record_locks.lock(&id.to_string()).await;
        self.put_object(&self.record_key(id), &serialize(record)?, Condition::None)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let _guard = self.record_locks.lock(&id.to_string()).await;
        self.delete_object(&self.record_key(id)).await
    }

    async fn compare_and_swap(
        &self,
        id: &ResourceId,
        expected: Option<u64>,
        new: Option<&StateRecord>,
    ) -> Result<bool> {
        let _guard = self.record_locks.lock(&id.to_string()).await;
        let key = self.record_key(id);
        let current = self.get_record(id).await?;

        match (expected, current) {
            (None, Some(_)) => Ok(false),
            (None, None) => match new {
                Some(record) => {
                    self.put_object(&key, &serialize(record)?, Condition::Absent)
                        .await
                }
                None => Ok(true),
            },
            (Some(_), None) => Ok(false),
            (Some(serial), Some((record, etag))) => {
                if record.serial != serial {
                    return Ok(false);
                }
                match new {
                    Some(next) => {
                        let condition = etag.as_deref().map_or(Condition::None, Condition::ETag);
                        self.put_object(&key, &serialize(next)?, condition).await
                    }
                    None => {
                        self.delete_object(&key).await?;
                        Ok(true)
                    }
                }
            }
        }
    }

    async fn list(&self) -> Result<Vec<StateRecord>> {
        let prefix = self.key(RECORDS_KEY);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::s3(format!("S3 list error: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| key.ends_with(".json"))
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((content, _)) = self.get_object(&key).await? {
                records.push(parse_record(&content)?);
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        info!(
            "Loaded {} record(s) from s3://{}/{prefix}",
            records.len(),
            self.bucket
        );
        Ok(records)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        // Check for existing lock
        let existing = self.read_lock().await?;
        if let Some((lock, _)) = &existing {
            if !lock.is_expired() {
                return Err(StratumError::State(StateError::LockedByOther {
                    holder: lock.holder.clone(),
                    since: lock.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        let condition = match &existing {
            None => Condition::Absent,
            Some((_, Some(etag))) => Condition::ETag(etag),
            Some((_, None)) => Condition::None,
        };

        if !self
            .put_object(&key, &serialize(&lock_info)?, condition)
            .await?
        {
            return Err(StratumError::State(StateError::LockFailed {
                message: String::from("another process acquired the lock concurrently"),
            }));
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some((existing, _)) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        let (existing, etag) = self
            .read_lock()
            .await?
            .filter(|(l, _)| l.lock_id == lock_id)
            .ok_or_else(|| lock_lost(lock_id))?;

        let renewed = existing.renewed();
        let condition = etag.as_deref().map_or(Condition::None, Condition::ETag);
        if !self
            .put_object(&self.key(LOCK_KEY), &serialize(&renewed)?, condition)
            .await?
        {
            return Err(lock_lost(lock_id));
        }
        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at);
        Ok(renewed)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock().await?.map(|(lock, _)| lock))
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.get_lock_info().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
