//! Error types for the Stratum reconciler.
//!
//! Errors are grouped by the stage that raises them: configuration and graph
//! construction, planning, per-resource apply, state storage and providers.
//! Build and plan errors abort a run; apply errors are collected per resource
//! and aggregated into [`ApplyFailed`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::planner::{Action, ApplyReport};

/// The main error type for the Stratum reconciler.
#[derive(Debug, Error)]
pub enum StratumError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The dependency graph contains a cycle.
    #[error("Dependency cycle: {0}")]
    Cycle(#[from] CycleError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// One or more resources failed to apply.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyFailed),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors outside of a plan step (refresh, recovery).
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate resource, module or output definition.
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName {
        /// What was duplicated (resource, module, output).
        kind: String,
        /// The duplicated name.
        name: String,
    },

    /// An interpolation expression could not be parsed.
    #[error("Invalid expression '{expression}' in {location}: {message}")]
    InvalidExpression {
        /// The offending expression text.
        expression: String,
        /// Where the expression appeared.
        location: String,
        /// What is wrong with it.
        message: String,
    },

    /// A variable was referenced but never defined.
    #[error("Undefined variable '{name}' referenced in {location}")]
    UndefinedVariable {
        /// Variable name.
        name: String,
        /// Where the variable was referenced.
        location: String,
    },

    /// A reference points at a resource that does not exist.
    #[error("Unknown resource '{target}' referenced in {location}")]
    UnknownResource {
        /// The referenced resource address.
        target: String,
        /// Where the reference appeared.
        location: String,
    },

    /// A reference points at an attribute the target neither declares nor computes.
    #[error("Resource '{target}' has no attribute '{attribute}' (referenced in {location})")]
    UnknownAttribute {
        /// The referenced resource address.
        target: String,
        /// The missing attribute.
        attribute: String,
        /// Where the reference appeared.
        location: String,
    },

    /// A reference points at a module or module output that does not exist.
    #[error("Unknown module output 'module.{module}.{output}' referenced in {location}")]
    UnknownModuleOutput {
        /// Child module name.
        module: String,
        /// Output name.
        output: String,
        /// Where the reference appeared.
        location: String,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// A dependency loop found while building the graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}", path.join(" -> "))]
pub struct CycleError {
    /// The nodes on the cycle, with the first node repeated at the end.
    pub path: Vec<String>,
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A reference never resolved to a concrete value.
    #[error("Unresolved reference in '{resource}': {reference} ({reason})")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: String,
        /// The reference text.
        reference: String,
        /// Why it could not be resolved.
        reason: String,
    },

    /// The state changed after the plan was produced.
    #[error("Plan is stale: state of '{resource}' changed since planning (expected serial {expected:?}, found {found:?})")]
    StalePlan {
        /// Resource whose record changed.
        resource: String,
        /// Serial recorded in the plan.
        expected: Option<u64>,
        /// Serial currently stored.
        found: Option<u64>,
    },

    /// The plan was produced for a different configuration.
    #[error("Plan was created for configuration {planned}, current configuration is {current}")]
    ConfigMismatch {
        /// Hash recorded in the plan.
        planned: String,
        /// Hash of the current configuration.
        current: String,
    },
}

/// Failure of a single plan step.
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    /// The provider rejected or failed the operation.
    #[error("provider failed to {action} '{resource}': {source}")]
    Provider {
        /// Resource being applied.
        resource: String,
        /// Action being performed.
        action: Action,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },

    /// The provider call exceeded the step timeout.
    #[error("timed out after {}s while applying '{resource}'", after.as_secs_f64())]
    Timeout {
        /// Resource being applied.
        resource: String,
        /// The configured timeout.
        after: Duration,
    },

    /// A reference could not be resolved at dispatch time.
    #[error("unresolved reference in '{resource}': {reference}")]
    Unresolved {
        /// Resource holding the reference.
        resource: String,
        /// The reference text.
        reference: String,
    },

    /// The stored record did not match what the step expected.
    #[error("state conflict for '{resource}': {message}")]
    StateConflict {
        /// Resource being applied.
        resource: String,
        /// Description of the conflict.
        message: String,
    },

    /// The state store failed.
    #[error("state store failed for '{resource}': {message}")]
    State {
        /// Resource being applied.
        resource: String,
        /// Store error message.
        message: String,
    },
}

/// Aggregate failure of an apply run: every failed node with its cause.
#[derive(Debug, Error)]
#[error("{} resource(s) failed, {} skipped: {}", failures.len(), skipped.len(), summarize(failures))]
pub struct ApplyFailed {
    /// Failed resources with their action and cause.
    pub failures: Vec<(String, Action, ApplyError)>,
    /// Resources skipped because a dependency failed.
    pub skipped: Vec<String>,
    /// Full per-entry report of the run.
    pub report: Box<ApplyReport>,
}

fn summarize(failures: &[(String, Action, ApplyError)]) -> String {
    failures
        .iter()
        .map(|(resource, action, cause)| format!("{action} {resource}: {cause}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// The record does not exist.
    #[error("No state recorded for resource: {id}")]
    RecordNotFound {
        /// Resource address.
        id: String,
    },
}

/// Errors reported by providers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider refused or failed the request.
    #[error("request rejected: {message}")]
    Rejected {
        /// Provider message.
        message: String,
    },

    /// The resource does not exist on the provider side.
    #[error("resource not found: {resource}")]
    NotFound {
        /// Resource address.
        resource: String,
    },

    /// Communication with the provider failed.
    #[error("transport failure: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// No provider handles this resource type.
    #[error("no provider handles resource type '{resource_type}'")]
    Unsupported {
        /// The unhandled type.
        resource_type: String,
    },
}

/// Result type alias for Stratum operations.
pub type Result<T> = std::result::Result<T, StratumError>;

impl StratumError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Transport { .. })
                | Self::State(StateError::LockFailed { .. })
                | Self::Apply(_)
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Transport { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. }) | Self::Apply(_) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

impl ApplyError {
    /// Returns the resource address the error belongs to.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Provider { resource, .. }
            | Self::Timeout { resource, .. }
            | Self::Unresolved { resource, .. }
            | Self::StateConflict { resource, .. }
            | Self::State { resource, .. } => resource,
        }
    }

    /// Returns true if the failure is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_display() {
        let err = CycleError {
            path: vec![
                String::from("network.a"),
                String::from("subnet.b"),
                String::from("network.a"),
            ],
        };
        assert_eq!(err.to_string(), "network.a -> subnet.b -> network.a");
    }

    #[test]
    fn test_retryable() {
        let err = StratumError::Provider(ProviderError::transport("reset"));
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(5));

        let err = StratumError::Config(ConfigError::validation_general("bad"));
        assert!(!err.is_retryable());
        assert_eq!(err.retry_delay_secs(), None);
    }

    #[test]
    fn test_apply_error_resource() {
        let err = ApplyError::Timeout {
            resource: String::from("service.api"),
            after: Duration::from_secs(3),
        };
        assert_eq!(err.resource(), "service.api");
        assert!(err.is_timeout());
        assert!(err.to_string().contains("3s"));
    }
}
