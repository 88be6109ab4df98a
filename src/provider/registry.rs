//! Provider dispatch by resource type.
//!
//! Resource types are prefixed with the name of the provider that handles
//! them: `aws_vpc` goes to the provider registered as `aws`. Types without a
//! matching provider fall back to the default provider, if one is set.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ProviderConfig, StackConfig};
use crate::error::{ConfigError, ProviderError, Result};
use crate::graph::AttributeMap;

use super::{
    ApplyRequest, DestroyRequest, HttpProvider, Lookup, Provider, ProviderResult, ReadRequest,
    SimulatedProvider,
};

/// Returns the provider prefix of a resource type (the part before the first `_`).
#[must_use]
pub fn provider_prefix(resource_type: &str) -> &str {
    resource_type
        .split_once('_')
        .map_or(resource_type, |(prefix, _)| prefix)
}

/// A set of named providers.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    default: Option<Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("default", &self.default.is_some())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under a name.
    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Sets the provider used when no named provider matches.
    #[must_use]
    pub fn with_default(mut self, provider: Arc<dyn Provider>) -> Self {
        self.default = Some(provider);
        self
    }

    /// Builds the registry described by a stack configuration.
    ///
    /// Without any configured provider every type goes to a simulated
    /// provider.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if `default_provider` names an unknown
    /// provider or an HTTP provider cannot be created.
    pub fn from_config(config: &StackConfig) -> Result<Self> {
        if config.providers.is_empty() {
            info!("No providers configured, using the simulated provider");
            return Ok(Self::new().with_default(Arc::new(SimulatedProvider::new())));
        }

        let mut registry = Self::new();
        for (name, provider_config) in &config.providers {
            let provider: Arc<dyn Provider> = match provider_config {
                ProviderConfig::Simulated { latency_ms } => Arc::new(
                    SimulatedProvider::new()
                        .with_latency(std::time::Duration::from_millis(*latency_ms)),
                ),
                ProviderConfig::Http {
                    endpoint,
                    timeout_secs,
                } => Arc::new(HttpProvider::new(endpoint, *timeout_secs).map_err(|e| {
                    ConfigError::validation(e.to_string(), format!("providers.{name}"))
                })?),
            };
            debug!("Registered provider '{name}'");
            registry.providers.insert(name.clone(), provider);
        }

        if let Some(name) = &config.default_provider {
            let provider = registry.providers.get(name).cloned().ok_or_else(|| {
                ConfigError::validation(
                    format!("unknown provider '{name}'"),
                    "default_provider",
                )
            })?;
            registry.default = Some(provider);
        }

        Ok(registry)
    }

    /// Names of the registered providers.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Finds the provider for a resource type.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unsupported` if no provider handles the type.
    pub fn resolve(&self, resource_type: &str) -> ProviderResult<&Arc<dyn Provider>> {
        self.providers
            .get(provider_prefix(resource_type))
            .or(self.default.as_ref())
            .ok_or_else(|| ProviderError::Unsupported {
                resource_type: resource_type.to_string(),
            })
    }
}

#[async_trait]
impl Provider for ProviderRegistry {
    async fn apply(&self, request: ApplyRequest) -> ProviderResult<AttributeMap> {
        self.resolve(&request.resource_type)?.apply(request).await
    }

    async fn destroy(&self, request: DestroyRequest) -> ProviderResult<()> {
        self.resolve(&request.resource_type)?.destroy(request).await
    }

    async fn lookup(&self, request: ReadRequest) -> ProviderResult<Lookup> {
        self.resolve(&request.resource_type)?.lookup(request).await
    }

    async fn read(&self, request: ReadRequest) -> ProviderResult<Option<AttributeMap>> {
        self.resolve(&request.resource_type)?.read(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceId;

    fn request(resource_type: &str) -> ApplyRequest {
        ApplyRequest {
            id: ResourceId::root(resource_type, "x"),
            resource_type: resource_type.to_string(),
            desired: AttributeMap::new(),
            prior: None,
        }
    }

    #[test]
    fn test_provider_prefix() {
        assert_eq!(provider_prefix("aws_vpc"), "aws");
        assert_eq!(provider_prefix("aws_ecs_service"), "aws");
        assert_eq!(provider_prefix("network"), "network");
    }

    #[tokio::test]
    async fn test_dispatch_by_prefix() {
        let aws = Arc::new(SimulatedProvider::new());
        let local = Arc::new(SimulatedProvider::new());
        let registry = ProviderRegistry::new()
            .with_provider("aws", aws.clone())
            .with_default(local.clone());

        registry.apply(request("aws_vpc")).await.unwrap();
        registry.apply(request("network")).await.unwrap();

        assert_eq!(aws.calls().len(), 1);
        assert_eq!(local.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_type() {
        let registry =
            ProviderRegistry::new().with_provider("aws", Arc::new(SimulatedProvider::new()));

        let err = registry.apply(request("gcp_network")).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Unsupported {
                resource_type: String::from("gcp_network")
            }
        );
    }

    #[test]
    fn test_from_config_rejects_unknown_default() {
        let config: StackConfig = serde_yaml::from_str(
            r"
project:
  name: demo
providers:
  aws:
    kind: simulated
default_provider: gcp
",
        )
        .unwrap();

        assert!(ProviderRegistry::from_config(&config).is_err());
    }

    #[test]
    fn test_from_config_without_providers_uses_simulated() {
        let config: StackConfig = serde_yaml::from_str("project:\n  name: demo\n").unwrap();
        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert!(registry.names().is_empty());
        assert!(registry.resolve("anything").is_ok());
    }
}
