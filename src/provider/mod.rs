//! Provider interface.
//!
//! Providers perform the actual side effects for a resource type. They are
//! handed to the executor and reconciler explicitly; nothing is registered
//! globally.

mod http;
mod registry;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::graph::{AttributeMap, ResourceId};

pub use http::HttpProvider;
pub use registry::{ProviderRegistry, provider_prefix};
pub use simulated::SimulatedProvider;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A create or update request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Resource address.
    pub id: ResourceId,
    /// Resource type.
    pub resource_type: String,
    /// Fully resolved desired attributes.
    pub desired: AttributeMap,
    /// Provider attributes from the last apply; `None` for a create.
    #[serde(default)]
    pub prior: Option<AttributeMap>,
}

/// A destroy request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyRequest {
    /// Resource address.
    pub id: ResourceId,
    /// Resource type.
    pub resource_type: String,
    /// Last recorded attributes.
    pub attributes: AttributeMap,
}

/// Request to read back or look up a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Resource address.
    pub id: ResourceId,
    /// Resource type.
    pub resource_type: String,
    /// Recorded attributes, or the desired ones for a lookup.
    pub attributes: AttributeMap,
}

/// Answer to a lookup for a resource whose create was interrupted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "attributes", rename_all = "snake_case")]
pub enum Lookup {
    /// The resource exists with these attributes.
    Found(AttributeMap),
    /// The resource does not exist.
    Absent,
    /// The provider cannot tell.
    Unknown,
}

/// Performs side effects for resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates or updates a resource, returning its attributes.
    async fn apply(&self, request: ApplyRequest) -> ProviderResult<AttributeMap>;

    /// Destroys a resource. `NotFound` means it is already gone.
    async fn destroy(&self, request: DestroyRequest) -> ProviderResult<()>;

    /// Checks whether a resource with an unconfirmed create exists.
    async fn lookup(&self, request: ReadRequest) -> ProviderResult<Lookup> {
        let _ = request;
        Ok(Lookup::Unknown)
    }

    /// Reads the current attributes of a resource; `None` if it is gone.
    async fn read(&self, request: ReadRequest) -> ProviderResult<Option<AttributeMap>> {
        Ok(Some(request.attributes))
    }
}
