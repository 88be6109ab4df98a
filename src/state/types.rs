//! State types for tracking managed resources.
//!
//! Each resource has its own record. Records are written one at a time by
//! the executor, so a crash mid-run leaves every finished step recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigHasher;
use crate::graph::{AttributeMap, ResourceId};

/// Current version of the record format.
pub const STATE_VERSION: &str = "1.0";

/// Lifecycle of a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Written before the provider create call; the outcome is unknown.
    Pending,
    /// The provider confirmed the resource.
    Confirmed,
}

/// The last-known state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    /// Record format version.
    pub version: String,
    /// Resource address.
    pub id: ResourceId,
    /// Resource type.
    pub resource_type: String,
    /// Lifecycle status.
    pub status: RecordStatus,
    /// Incremented on every write; used for compare-and-swap.
    pub serial: u64,
    /// Attributes last sent to the provider.
    pub desired: AttributeMap,
    /// Attributes returned by the provider.
    pub attributes: AttributeMap,
    /// Hash of `desired`.
    pub desired_hash: String,
    /// Resources this one depended on when last applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    /// When the record was first written.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// Creates a pending marker written before the provider creates the resource.
    #[must_use]
    pub fn pending(id: ResourceId, desired: AttributeMap, dependencies: Vec<ResourceId>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            resource_type: id.resource_type.clone(),
            id,
            status: RecordStatus::Pending,
            serial: 1,
            desired_hash: ConfigHasher::hash_attributes(&desired),
            desired,
            attributes: AttributeMap::new(),
            dependencies,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a confirmed record directly, e.g. when adopting a resource.
    #[must_use]
    pub fn confirmed(
        id: ResourceId,
        desired: AttributeMap,
        attributes: AttributeMap,
        dependencies: Vec<ResourceId>,
    ) -> Self {
        Self::pending(id, desired, dependencies).confirm(attributes)
    }

    /// Returns the successor record holding the provider's attributes.
    #[must_use]
    pub fn confirm(&self, attributes: AttributeMap) -> Self {
        Self {
            status: RecordStatus::Confirmed,
            serial: self.serial + 1,
            attributes,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Returns the successor record after an in-place update.
    #[must_use]
    pub fn updated(
        &self,
        desired: AttributeMap,
        attributes: AttributeMap,
        dependencies: Vec<ResourceId>,
    ) -> Self {
        Self {
            status: RecordStatus::Confirmed,
            serial: self.serial + 1,
            desired_hash: ConfigHasher::hash_attributes(&desired),
            desired,
            attributes,
            dependencies,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Returns the successor record with refreshed provider attributes.
    #[must_use]
    pub fn refreshed(&self, attributes: AttributeMap) -> Self {
        Self {
            serial: self.serial + 1,
            attributes,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Returns true if the record is an unconfirmed create marker.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == RecordStatus::Pending
    }

    /// Looks up an attribute, preferring the provider's value over the desired one.
    #[must_use]
    pub fn value(&self, attribute: &str) -> Option<&Value> {
        self.attributes
            .get(attribute)
            .or_else(|| self.desired.get(attribute))
    }

    /// Desired attributes overlaid with provider attributes.
    #[must_use]
    pub fn merged_attributes(&self) -> AttributeMap {
        let mut merged = self.desired.clone();
        merged.extend(self.attributes.clone());
        merged
    }
}
