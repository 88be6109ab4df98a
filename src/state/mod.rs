//! State management module for the reconciler.
//!
//! This module provides persistent, per-resource state storage: the last
//! desired and actual attributes of every managed resource, written one
//! record at a time with compare-and-swap.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{KeyedLocks, LOCK_EXPIRY_SECS, LOCK_RENEWAL_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::{StateStore, record_file_name, serial_matches};
pub use types::{RecordStatus, STATE_VERSION, StateRecord};
