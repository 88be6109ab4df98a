//! Configuration specification types for the reconciler.
//!
//! This module defines all the structs that map to the `stratum.yaml` file.
//! These types are declarative and fully describe the desired stack.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The root configuration structure of a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Named providers, keyed by the resource type prefix they handle.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Provider used for resource types no named provider handles.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Root module variables.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableConfig>,
    /// Per-environment variable overlays.
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    /// Root module resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Child modules of the root module.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    /// Root module outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
    /// In-process state, discarded on exit.
    Memory,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of steps in flight.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Per-step timeout in seconds.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    /// Attempts made by `reconcile` before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            step_timeout_secs: None,
            max_attempts: default_max_attempts(),
        }
    }
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// In-memory provider that echoes desired attributes.
    Simulated {
        /// Artificial latency per call in milliseconds.
        #[serde(default)]
        latency_ms: u64,
    },
    /// JSON over HTTP provider.
    Http {
        /// Base URL of the provider service.
        endpoint: String,
        /// Request timeout in seconds.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

/// A variable declaration with an optional default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VariableConfig {
    /// Default value.
    #[serde(default)]
    pub default: Option<Value>,
    /// Human readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Variable values for one environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    /// Values overriding root variable defaults.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type, e.g. `network`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Name, unique per type within the module.
    pub name: String,
    /// Declared attributes; strings may contain `${...}` expressions.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Attributes assigned by the provider, in addition to `id`.
    #[serde(default)]
    pub computed: Vec<String>,
    /// Attributes whose change forces destroy-then-create.
    #[serde(default)]
    pub replace_on_change: Vec<String>,
    /// Explicit dependencies: `TYPE.NAME` or `module.NAME`.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A child module, declared inline or loaded from `source`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    /// Module name, unique within its parent.
    pub name: String,
    /// Path to a module file, relative to the declaring file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Values for the module's variables; may reference the parent scope.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// Variables the module accepts, with defaults.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableConfig>,
    /// Module resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Nested modules.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    /// Values exposed to the parent as `module.NAME.OUTPUT`.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Contents of a module file referenced through `source`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleSource {
    /// Variables the module accepts, with defaults.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableConfig>,
    /// Module resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Nested modules.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    /// Module outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

const fn default_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

fn default_environment() -> String {
    String::from("dev")
}

impl StackConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns true if the stack targets a production environment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self.project.environment.as_str(), "prod" | "production")
    }

    /// Counts resources across all modules.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        fn count(modules: &[ModuleConfig]) -> usize {
            modules
                .iter()
                .map(|m| m.resources.len() + count(&m.modules))
                .sum()
        }
        self.resources.len() + count(&self.modules)
    }

    /// Root variable values for an environment: defaults, then the overlay.
    #[must_use]
    pub fn variable_values(&self, environment: &str) -> BTreeMap<String, Value> {
        let mut values: BTreeMap<String, Value> = self
            .variables
            .iter()
            .filter_map(|(name, var)| var.default.clone().map(|v| (name.clone(), v)))
            .collect();

        if let Some(overlay) = self.environments.get(environment) {
            values.extend(overlay.variables.clone());
        }

        values
    }
}

impl ModuleConfig {
    /// Returns true if the module declares no body of its own.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
            && self.resources.is_empty()
            && self.modules.is_empty()
            && self.outputs.is_empty()
    }

    /// Replaces the module body with the contents of a module file.
    pub fn inline(&mut self, source: ModuleSource) {
        self.variables = source.variables;
        self.resources = source.resources;
        self.modules = source.modules;
        self.outputs = source.outputs;
    }
}

impl ResourceConfig {
    /// Returns the `TYPE.NAME` address within the module.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STACK: &str = r#"
project:
  name: demo
  environment: staging
variables:
  cidr:
    default: "10.0.0.0/16"
  replicas:
    default: 1
environments:
  prod:
    variables:
      replicas: 3
resources:
  - type: network
    name: main
    attributes:
      cidr: "${var.cidr}"
modules:
  - name: app
    inputs:
      network_id: "${network.main.id}"
    resources:
      - type: service
        name: api
        attributes:
          network: "${var.network_id}"
"#;

    #[test]
    fn test_parse_stack() {
        let config: StackConfig = serde_yaml::from_str(STACK).unwrap();
        assert_eq!(config.project.environment, "staging");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.execution.parallelism, 4);
        assert_eq!(config.resource_count(), 2);
        assert_eq!(config.resources[0].address(), "network.main");
        assert_eq!(config.qualified_name(), "demo-staging");
        assert!(!config.is_production());
    }

    #[test]
    fn test_environment_overlay() {
        let config: StackConfig = serde_yaml::from_str(STACK).unwrap();
        let dev = config.variable_values("dev");
        assert_eq!(dev.get("replicas"), Some(&json!(1)));
        let prod = config.variable_values("prod");
        assert_eq!(prod.get("replicas"), Some(&json!(3)));
        assert_eq!(prod.get("cidr"), Some(&json!("10.0.0.0/16")));
    }

    #[test]
    fn test_provider_config() {
        let yaml = r"
kind: http
endpoint: http://localhost:8080
";
        let provider: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            provider,
            ProviderConfig::Http {
                endpoint: String::from("http://localhost:8080"),
                timeout_secs: None,
            }
        );
    }
}
