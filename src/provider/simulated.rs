//! In-memory provider.
//!
//! Echoes desired attributes back and assigns `id = <type>-<uuid>` on
//! create. Supports injected failures, latency and drift so that the
//! executor and reconciler can be exercised without a real backend.
//!
//! Resources live only as long as the provider. Ids it has never handled
//! were created by another process, so reads echo the recorded attributes
//! and lookups answer `Unknown` for them.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::graph::{AttributeMap, ID_ATTRIBUTE, ResourceId};
use crate::planner::Action;

use super::{ApplyRequest, DestroyRequest, Lookup, Provider, ProviderResult, ReadRequest};

#[derive(Debug, Clone)]
struct Fault {
    remaining: Option<u32>,
    message: String,
}

/// Provider that keeps resources in memory.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    resources: Mutex<BTreeMap<ResourceId, AttributeMap>>,
    handled: Mutex<BTreeSet<ResourceId>>,
    faults: Mutex<HashMap<ResourceId, Fault>>,
    calls: Mutex<Vec<(Action, ResourceId)>>,
    latency: Duration,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a delay to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every apply and destroy of `id` fail.
    pub fn fail_on(&self, id: &ResourceId, message: &str) {
        guard(&self.faults).insert(
            id.clone(),
            Fault {
                remaining: None,
                message: message.to_string(),
            },
        );
    }

    /// Makes the next `times` applies or destroys of `id` fail.
    pub fn fail_times(&self, id: &ResourceId, times: u32, message: &str) {
        guard(&self.faults).insert(
            id.clone(),
            Fault {
                remaining: Some(times),
                message: message.to_string(),
            },
        );
    }

    /// Removes injected failures for `id`.
    pub fn clear_failure(&self, id: &ResourceId) {
        guard(&self.faults).remove(id);
    }

    /// Every apply and destroy received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(Action, ResourceId)> {
        guard(&self.calls).clone()
    }

    /// Returns true if the resource currently exists.
    #[must_use]
    pub fn exists(&self, id: &ResourceId) -> bool {
        guard(&self.resources).contains_key(id)
    }

    /// Current attributes of a resource.
    #[must_use]
    pub fn attributes(&self, id: &ResourceId) -> Option<AttributeMap> {
        guard(&self.resources).get(id).cloned()
    }

    /// Changes an attribute behind the reconciler's back.
    pub fn set_drift(&self, id: &ResourceId, attribute: &str, value: Value) {
        if let Some(attributes) = guard(&self.resources).get_mut(id) {
            attributes.insert(attribute.to_string(), value);
        }
    }

    /// Removes a resource behind the reconciler's back.
    pub fn forget(&self, id: &ResourceId) {
        guard(&self.resources).remove(id);
    }

    fn check_fault(&self, id: &ResourceId) -> ProviderResult<()> {
        let mut faults = guard(&self.faults);
        let Some(fault) = faults.get_mut(id) else {
            return Ok(());
        };
        let message = fault.message.clone();
        match &mut fault.remaining {
            None => {}
            Some(0) => {
                faults.remove(id);
                return Ok(());
            }
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    faults.remove(id);
                }
            }
        }
        Err(ProviderError::rejected(message))
    }

    fn handles(&self, id: &ResourceId) -> bool {
        guard(&self.handled).contains(id)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn apply(&self, request: ApplyRequest) -> ProviderResult<AttributeMap> {
        self.delay().await;
        let action = if request.prior.is_some() {
            Action::Update
        } else {
            Action::Create
        };
        guard(&self.calls).push((action, request.id.clone()));
        self.check_fault(&request.id)?;

        let id = request
            .prior
            .as_ref()
            .and_then(|prior| prior.get(ID_ATTRIBUTE).cloned())
            .unwrap_or_else(|| {
                let suffix = Uuid::new_v4().simple().to_string();
                json!(format!("{}-{}", request.resource_type, &suffix[..8]))
            });

        let mut attributes = request.desired;
        attributes.insert(ID_ATTRIBUTE.to_string(), id);
        debug!("Simulated {action} of {}", request.id);
        guard(&self.handled).insert(request.id.clone());
        guard(&self.resources).insert(request.id, attributes.clone());
        Ok(attributes)
    }

    async fn destroy(&self, request: DestroyRequest) -> ProviderResult<()> {
        self.delay().await;
        guard(&self.calls).push((Action::Destroy, request.id.clone()));
        self.check_fault(&request.id)?;

        guard(&self.handled).insert(request.id.clone());
        if guard(&self.resources).remove(&request.id).is_none() {
            return Err(ProviderError::NotFound {
                resource: request.id.to_string(),
            });
        }
        debug!("Simulated destroy of {}", request.id);
        Ok(())
    }

    async fn lookup(&self, request: ReadRequest) -> ProviderResult<Lookup> {
        if let Some(attributes) = guard(&self.resources).get(&request.id) {
            return Ok(Lookup::Found(attributes.clone()));
        }
        if self.handles(&request.id) {
            Ok(Lookup::Absent)
        } else {
            Ok(Lookup::Unknown)
        }
    }

    async fn read(&self, request: ReadRequest) -> ProviderResult<Option<AttributeMap>> {
        if let Some(attributes) = guard(&self.resources).get(&request.id) {
            return Ok(Some(attributes.clone()));
        }
        if self.handles(&request.id) {
            Ok(None)
        } else {
            debug!("{} was not created here, echoing its record", request.id);
            Ok(Some(request.attributes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ResourceId {
        ResourceId::root("network", "main")
    }

    fn create() -> ApplyRequest {
        ApplyRequest {
            id: id(),
            resource_type: String::from("network"),
            desired: AttributeMap::from([(String::from("cidr"), json!("10.0.0.0/16"))]),
            prior: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id() {
        let provider = SimulatedProvider::new();
        let attributes = provider.apply(create()).await.unwrap();

        let assigned = attributes.get("id").and_then(Value::as_str).unwrap();
        assert!(assigned.starts_with("network-"));
        assert_eq!(assigned.len(), "network-".len() + 8);
        assert!(provider.exists(&id()));
    }

    #[tokio::test]
    async fn test_update_keeps_id() {
        let provider = SimulatedProvider::new();
        let created = provider.apply(create()).await.unwrap();

        let mut update = create();
        update.prior = Some(created.clone());
        update.desired.insert(String::from("cidr"), json!("10.1.0.0/16"));
        let updated = provider.apply(update).await.unwrap();

        assert_eq!(updated.get("id"), created.get("id"));
        assert_eq!(provider.calls().len(), 2);
        assert_eq!(provider.calls()[1].0, Action::Update);
    }

    #[tokio::test]
    async fn test_fail_times_then_succeeds() {
        let provider = SimulatedProvider::new();
        provider.fail_times(&id(), 1, "boom");

        assert_eq!(
            provider.apply(create()).await.unwrap_err(),
            ProviderError::rejected("boom")
        );
        assert!(provider.apply(create()).await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_missing_is_not_found() {
        let provider = SimulatedProvider::new();
        let request = DestroyRequest {
            id: id(),
            resource_type: String::from("network"),
            attributes: AttributeMap::new(),
        };
        assert!(matches!(
            provider.destroy(request).await,
            Err(ProviderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_drift_is_visible_to_read() {
        let provider = SimulatedProvider::new();
        let created = provider.apply(create()).await.unwrap();
        provider.set_drift(&id(), "cidr", json!("192.168.0.0/16"));

        let read = provider
            .read(ReadRequest {
                id: id(),
                resource_type: String::from("network"),
                attributes: created,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.get("cidr"), Some(&json!("192.168.0.0/16")));
    }

    #[tokio::test]
    async fn test_foreign_resource_is_echoed_not_missing() {
        let provider = SimulatedProvider::new();
        let recorded = AttributeMap::from([(String::from("id"), json!("network-1234abcd"))]);
        let request = ReadRequest {
            id: id(),
            resource_type: String::from("network"),
            attributes: recorded.clone(),
        };

        assert_eq!(provider.read(request.clone()).await.unwrap(), Some(recorded));
        assert_eq!(provider.lookup(request.clone()).await.unwrap(), Lookup::Unknown);

        // Once handled here, a vanished resource is reported as gone.
        provider.apply(create()).await.unwrap();
        provider.forget(&id());
        assert_eq!(provider.read(request.clone()).await.unwrap(), None);
        assert_eq!(provider.lookup(request).await.unwrap(), Lookup::Absent);
    }
}
