//! Configuration validation for stack files.
//!
//! This module checks a stack configuration for invalid names, missing
//! backend settings and suspicious declarations before any graph is built.
//! Reference resolution errors are reported by the graph builder.

use crate::error::{ConfigError, Result, StratumError};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    ExecutionConfig, ModuleConfig, ProjectConfig, ProviderConfig, ResourceConfig, StackConfig,
    StateBackend, StateConfig,
};

/// Environments the CLI knows how to treat.
pub const KNOWN_ENVIRONMENTS: &[&str] = &["dev", "staging", "prod"];

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StratumError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, config, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_providers(config, &mut result);
        Self::validate_module("", &config.resources, &config.modules, &mut result);

        if config.resource_count() == 0 {
            result.warn("Stack declares no resources");
        }

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, config: &StackConfig, result: &mut ValidationResult) {
        // Project name must be valid
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        // Environment must be valid
        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        } else if !KNOWN_ENVIRONMENTS.contains(&project.environment.as_str())
            && !config.environments.contains_key(&project.environment)
        {
            result.warn(format!(
                "Environment '{}' is neither a standard environment ({}) nor declared under 'environments'",
                project.environment,
                KNOWN_ENVIRONMENTS.join(", ")
            ));
        }

        for (env, overlay) in &config.environments {
            for name in overlay.variables.keys() {
                if !config.variables.contains_key(name) {
                    result.warn(format!(
                        "Environment '{env}' sets undeclared variable '{name}'"
                    ));
                }
            }
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result.warn("state.bucket is ignored by the local backend");
                }
            }
            StateBackend::Memory => {
                result.warn("Memory state backend keeps no state between runs");
            }
        }
    }

    /// Validates executor settings.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.parallelism == 0 {
            result.error("execution.parallelism", "Parallelism must be at least 1");
        }
        if execution.step_timeout_secs == Some(0) {
            result.error(
                "execution.step_timeout_secs",
                "Step timeout must be greater than zero",
            );
        }
        if execution.max_attempts == 0 {
            result.error("execution.max_attempts", "Max attempts must be at least 1");
        }
    }

    /// Validates provider declarations.
    fn validate_providers(config: &StackConfig, result: &mut ValidationResult) {
        for (name, provider) in &config.providers {
            if let ProviderConfig::Http { endpoint, timeout_secs } = provider {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    result.error(
                        format!("providers.{name}.endpoint"),
                        format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    );
                }
                if *timeout_secs == Some(0) {
                    result.error(
                        format!("providers.{name}.timeout_secs"),
                        "Timeout must be greater than zero",
                    );
                }
            }
        }

        if let Some(default) = &config.default_provider {
            if !config.providers.contains_key(default) {
                result.error(
                    "default_provider",
                    format!("Default provider '{default}' is not declared under 'providers'"),
                );
            }
        }
    }

    /// Validates the resources and child modules of one module, recursively.
    fn validate_module(
        path: &str,
        resources: &[ResourceConfig],
        modules: &[ModuleConfig],
        result: &mut ValidationResult,
    ) {
        let mut seen = HashSet::new();
        for (i, resource) in resources.iter().enumerate() {
            let field = format!("{path}resources[{i}]");
            Self::validate_resource(&field, resource, result);

            if !seen.insert(resource.address()) {
                result.error(
                    field,
                    format!("Duplicate resource '{path}{}'", resource.address()),
                );
            }
        }

        let mut names = HashSet::new();
        for module in modules {
            let field = format!("{path}module.{}", module.name);
            if !is_valid_identifier(&module.name) {
                result.error(
                    format!("{field}.name"),
                    format!("Module name '{}' is invalid", module.name),
                );
            }
            if !names.insert(module.name.as_str()) {
                result.error(field.clone(), format!("Duplicate module '{}'", module.name));
            }
            if !module.variables.is_empty() {
                for input in module.inputs.keys() {
                    if !module.variables.contains_key(input) {
                        result.warn(format!(
                            "Module '{}' receives input '{input}' it does not declare",
                            module.name
                        ));
                    }
                }
            }

            Self::validate_module(&format!("{field}."), &module.resources, &module.modules, result);
        }
    }

    /// Validates one resource declaration.
    fn validate_resource(field: &str, resource: &ResourceConfig, result: &mut ValidationResult) {
        if !is_valid_type(&resource.resource_type) {
            result.error(
                format!("{field}.type"),
                format!(
                    "Resource type '{}' is invalid. Must be lowercase alphanumeric with underscores.",
                    resource.resource_type
                ),
            );
        }
        if !is_valid_identifier(&resource.name) {
            result.error(
                format!("{field}.name"),
                format!("Resource name '{}' is invalid", resource.name),
            );
        }

        for attribute in &resource.replace_on_change {
            if !resource.attributes.contains_key(attribute) {
                result.warn(format!(
                    "{}: replace_on_change names undeclared attribute '{attribute}'",
                    resource.address()
                ));
            }
        }
        for attribute in &resource.computed {
            if resource.attributes.contains_key(attribute) {
                result.warn(format!(
                    "{}: attribute '{attribute}' is both declared and computed",
                    resource.address()
                ));
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    if !chars.next().is_some_and(|first| first.is_ascii_lowercase()) {
        return false;
    }

    // Rest must be lowercase alphanumeric or hyphen
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    // Cannot end with hyphen or have consecutive hyphens
    !name.ends_with('-') && !name.contains("--")
}

/// Resource types: lowercase alphanumeric with underscores, starting with a letter.
fn is_valid_type(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|first| first.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Resource and module names: alphanumeric, `_` or `-`, starting with a letter.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> StackConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("web-stack"));
        assert!(is_valid_name("my-stack-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Web-Stack")); // uppercase
        assert!(!is_valid_name("123-stack")); // starts with number
        assert!(!is_valid_name("web_stack")); // underscore
        assert!(!is_valid_name("stack-")); // ends with hyphen
        assert!(!is_valid_name("web--stack")); // consecutive hyphens
    }

    #[test]
    fn test_resource_names() {
        assert!(is_valid_type("aws_vpc"));
        assert!(!is_valid_type("AwsVpc"));
        assert!(!is_valid_type("_vpc"));
        assert!(is_valid_identifier("main-1"));
        assert!(is_valid_identifier("Main_1"));
        assert!(!is_valid_identifier("1main"));
        assert!(!is_valid_identifier("a.b"));
    }

    #[test]
    fn test_valid_stack() {
        let config = parse(
            r"
project:
  name: demo
  environment: dev
resources:
  - type: network
    name: main
    attributes:
      cidr: 10.0.0.0/16
    replace_on_change: [cidr]
",
        );
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let config = parse(
            r"
project:
  name: demo
state:
  backend: s3
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(!result.is_valid());
        assert_eq!(result.errors[0].field, "state.bucket");
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_nested_errors_and_warnings() {
        let config = parse(
            r"
project:
  name: demo
  environment: qa
execution:
  parallelism: 0
default_provider: missing
modules:
  - name: app
    variables:
      image: {}
    inputs:
      tag: v1
    resources:
      - type: Service
        name: api
        replace_on_change: [image]
      - type: Service
        name: api
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"execution.parallelism"));
        assert!(fields.contains(&"default_provider"));
        assert!(fields.contains(&"module.app.resources[0].type"));
        assert!(fields.contains(&"module.app.resources[1]"));

        assert!(result.warnings.iter().any(|w| w.contains("'qa'")));
        assert!(result.warnings.iter().any(|w| w.contains("input 'tag'")));
        assert!(result.warnings.iter().any(|w| w.contains("replace_on_change")));
    }

    #[test]
    fn test_http_provider_endpoint() {
        let config = parse(
            r"
project:
  name: demo
providers:
  cloud:
    kind: http
    endpoint: localhost:8080
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.errors[0].field, "providers.cloud.endpoint");
    }
}
