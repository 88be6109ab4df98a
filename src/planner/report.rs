//! Results of applying a plan.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::{ApplyError, ApplyFailed};
use crate::graph::{AttributeMap, ResourceId};

use super::plan::Action;

/// Final status of one plan entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The step ran and succeeded.
    Succeeded,
    /// No-op entry; nothing ran.
    Unchanged,
    /// The step ran and failed.
    Failed,
    /// Not run because a prerequisite failed.
    Skipped,
    /// Not run because the run was cancelled.
    Cancelled,
    /// Dry run: the step would have run.
    Planned,
}

impl StepStatus {
    /// Returns true if dependents may proceed.
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Succeeded | Self::Unchanged | Self::Planned)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::Planned => "planned",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one plan entry.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Index of the entry in the plan.
    pub index: usize,
    /// Resource address.
    pub id: ResourceId,
    /// Action of the entry.
    pub action: Action,
    /// Whether the entry is half of a replacement.
    pub replacement: bool,
    /// Final status.
    pub status: StepStatus,
    /// Failure cause, for failed steps.
    pub error: Option<ApplyError>,
    /// Attributes returned by the provider, for successful creates and updates.
    pub attributes: Option<AttributeMap>,
    /// Wall-clock time of the step.
    pub duration_ms: u64,
}

#[derive(Serialize)]
struct OutcomeJson<'a> {
    index: usize,
    id: &'a ResourceId,
    action: Action,
    replacement: bool,
    status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    duration_ms: u64,
}

/// Per-entry results of an apply run.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// Outcomes in plan order.
    pub outcomes: Vec<StepOutcome>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl ApplyReport {
    /// Outcomes with the given status.
    #[must_use]
    pub fn with_status(&self, status: StepStatus) -> Vec<&StepOutcome> {
        self.outcomes.iter().filter(|o| o.status == status).collect()
    }

    /// Failed outcomes.
    #[must_use]
    pub fn failures(&self) -> Vec<&StepOutcome> {
        self.with_status(StepStatus::Failed)
    }

    /// Outcomes skipped because a prerequisite failed.
    #[must_use]
    pub fn skipped(&self) -> Vec<&StepOutcome> {
        self.with_status(StepStatus::Skipped)
    }

    /// Number of steps that ran and succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.with_status(StepStatus::Succeeded).len()
    }

    /// Returns true if nothing failed, was skipped or was cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.outcomes.iter().all(|o| o.status.is_complete())
    }

    /// Finds the outcome of a resource's step with the given action.
    #[must_use]
    pub fn outcome(&self, id: &ResourceId, action: Action) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.id == *id && o.action == action)
    }

    /// Converts the report into an error if any step failed.
    ///
    /// # Errors
    ///
    /// Returns `ApplyFailed` listing every failed and skipped resource.
    pub fn into_result(self) -> Result<Self, ApplyFailed> {
        if self.failures().is_empty() {
            return Ok(self);
        }

        let failures = self
            .outcomes
            .iter()
            .filter_map(|o| {
                o.error
                    .clone()
                    .map(|e| (o.id.to_string(), o.action, e))
            })
            .collect();
        let skipped = self.skipped().iter().map(|o| o.id.to_string()).collect();

        Err(ApplyFailed {
            failures,
            skipped,
            report: Box::new(self),
        })
    }

    /// JSON representation for machine-readable output.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let outcomes: Vec<OutcomeJson<'_>> = self
            .outcomes
            .iter()
            .map(|o| OutcomeJson {
                index: o.index,
                id: &o.id,
                action: o.action,
                replacement: o.replacement,
                status: o.status,
                error: o.error.as_ref().map(ToString::to_string),
                duration_ms: o.duration_ms,
            })
            .collect();

        serde_json::json!({
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "cancelled": self.cancelled,
            "success": self.is_success(),
            "outcomes": outcomes,
        })
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = |status| self.with_status(status).len();
        write!(
            f,
            "{} succeeded, {} unchanged, {} failed, {} skipped, {} cancelled",
            count(StepStatus::Succeeded),
            count(StepStatus::Unchanged),
            count(StepStatus::Failed),
            count(StepStatus::Skipped),
            count(StepStatus::Cancelled),
        )?;
        let planned = count(StepStatus::Planned);
        if planned > 0 {
            write!(f, ", {planned} planned")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    fn outcome(index: usize, name: &str, status: StepStatus) -> StepOutcome {
        let id = ResourceId::root("service", name);
        StepOutcome {
            index,
            error: (status == StepStatus::Failed).then(|| ApplyError::Provider {
                resource: id.to_string(),
                action: Action::Create,
                source: ProviderError::rejected("quota exceeded"),
            }),
            id,
            action: Action::Create,
            replacement: false,
            status,
            attributes: None,
            duration_ms: 1,
        }
    }

    fn report(outcomes: Vec<StepOutcome>) -> ApplyReport {
        ApplyReport {
            outcomes,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cancelled: false,
        }
    }

    #[test]
    fn test_successful_report() {
        let report = report(vec![
            outcome(0, "a", StepStatus::Succeeded),
            outcome(1, "b", StepStatus::Unchanged),
        ]);
        assert!(report.is_success());
        assert_eq!(report.succeeded(), 1);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_failed_report_lists_failures_and_skips() {
        let report = report(vec![
            outcome(0, "a", StepStatus::Failed),
            outcome(1, "b", StepStatus::Skipped),
            outcome(2, "c", StepStatus::Succeeded),
        ]);
        assert!(!report.is_success());

        let err = report.into_result().unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, "service.a");
        assert_eq!(err.skipped, vec![String::from("service.b")]);
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn test_report_json() {
        let report = report(vec![outcome(0, "a", StepStatus::Failed)]);
        let json = report.to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["outcomes"][0]["status"], "failed");
        assert_eq!(json["outcomes"][0]["id"], "service.a");
    }
}
