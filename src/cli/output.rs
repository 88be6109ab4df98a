//! Output formatting for CLI commands.
//!
//! This module renders plans, reports and state for display, either as
//! colored tables or as JSON for scripting.

use colored::Colorize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, StackConfig, ValidationResult};
use crate::graph::render_scalar;
use crate::planner::{Action, ApplyReport, Plan, PlanEntry, StepStatus};
use crate::reconciler::{DriftKind, DriftReport, ReconcileResult, RecoveryAction, RecoveryReport};
use crate::state::{LockInfo, RecordStatus, StateRecord};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan entry row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Step outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Time")]
    duration: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Serial")]
    serial: u64,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => pretty(&json!({
                "config_hash": plan.config_hash,
                "environment": plan.environment,
                "destroy": plan.destroy,
                "summary": plan.summary(),
                "changes": plan.review(),
            })),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. Recorded state matches the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let title = if plan.destroy { "Destroy Plan" } else { "Plan" };
        let _ = writeln!(output, "\n{} ({})", title.bold(), plan.environment);
        let _ = write!(
            output,
            "   Config hash: {}\n\n",
            ConfigHasher::short_hash(&plan.config_hash)
        );

        let changes = plan.changes();
        let rows: Vec<PlanRow> = changes
            .iter()
            .enumerate()
            .map(|(i, entry)| PlanRow {
                index: i + 1,
                action: Self::format_action(entry),
                resource: entry.id.to_string(),
                reason: Self::truncate(&entry.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for entry in changes.iter().filter(|e| !e.changes.is_empty()) {
                let _ = writeln!(output, "\n  {}", entry.id.to_string().bold());
                for change in &entry.changes {
                    let line = format!("      {change}");
                    if change.forces_replacement {
                        let _ = writeln!(output, "{}", line.red());
                    } else {
                        let _ = writeln!(output, "{line}");
                    }
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.destroy.to_string().red()
        );

        output
    }

    /// Formats the report of an apply run.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => pretty(&report.to_json()),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ApplyReport) -> String {
        let mut output = String::new();

        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .filter(|o| o.action != Action::NoOp)
            .map(|o| OutcomeRow {
                resource: o.id.to_string(),
                action: o.action.symbol(o.replacement).to_string(),
                status: Self::format_step_status(o.status),
                duration: format!("{}ms", o.duration_ms),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        for outcome in report.failures() {
            if let Some(error) = &outcome.error {
                let _ = writeln!(output, "{} {}: {error}", "✗".red(), outcome.id);
            }
        }

        let status = if report.is_success() {
            format!("{} Apply complete", "✓".green())
        } else if report.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else {
            format!("{} Apply failed", "✗".red())
        };
        let _ = write!(output, "\n{status}: {report}\n");
        output
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconcile(&self, result: &ReconcileResult) -> String {
        match self.format {
            OutputFormat::Json => pretty(&json!({
                "attempts": result.attempts,
                "converged": result.converged,
                "summary": result.summary,
                "report": result.report.as_ref().map(ApplyReport::to_json),
            })),
            OutputFormat::Text => {
                let status = if result.converged {
                    format!("{} Reconciliation successful", "✓".green())
                } else {
                    format!("{} Reconciliation incomplete", "⚠".yellow())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Attempts: {}", result.attempts);
                let _ = writeln!(output, "   Created: {}", result.summary.create);
                let _ = writeln!(output, "   Updated: {}", result.summary.update);
                let _ = writeln!(output, "   Replaced: {}", result.summary.replace);
                let _ = writeln!(output, "   Destroyed: {}", result.summary.destroy);
                let _ = writeln!(output, "   Unchanged: {}", result.summary.unchanged);
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => pretty(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected.\n", "✓".green());
                }

                let mut output = if report.refreshed {
                    format!("{} State refreshed:\n\n", "✓".green())
                } else {
                    format!("{} Drift detected:\n\n", "⚠".yellow())
                };
                for resource in &report.drifted {
                    let detail = match &resource.drift {
                        DriftKind::Changed(attributes) => {
                            format!("changed: {}", attributes.join(", ")).yellow()
                        }
                        DriftKind::Missing => "missing".red(),
                        DriftKind::Pending => "pending create, run `stratum recover`".dimmed(),
                    };
                    let _ = writeln!(output, "   - {} ({detail})", resource.id);
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.drifted.len(),
                    report.checked
                );
                output
            }
        }
    }

    /// Formats a recovery report.
    #[must_use]
    pub fn format_recovery(&self, report: &RecoveryReport) -> String {
        match self.format {
            OutputFormat::Json => pretty(report),
            OutputFormat::Text => {
                if report.resources.is_empty() {
                    return format!("{} No pending records.\n", "✓".green());
                }
                let mut output = String::new();
                for (id, action) in &report.resources {
                    let label = match action {
                        RecoveryAction::Adopted => "adopted".green(),
                        RecoveryAction::Removed => "removed".yellow(),
                        RecoveryAction::Unresolved => "unresolved".red(),
                    };
                    let _ = writeln!(output, "   {id}: {label}");
                }
                output
            }
        }
    }

    /// Formats stack outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => pretty(outputs),
            OutputFormat::Text => outputs.iter().fold(String::new(), |mut output, (k, v)| {
                let _ = writeln!(output, "{k} = {}", render_scalar(v));
                output
            }),
        }
    }

    /// Formats a list of state records.
    #[must_use]
    pub fn format_records(&self, records: &[StateRecord]) -> String {
        match self.format {
            OutputFormat::Json => pretty(records),
            OutputFormat::Text => {
                if records.is_empty() {
                    return String::from("No resources recorded.\n");
                }
                let rows: Vec<RecordRow> = records
                    .iter()
                    .map(|r| RecordRow {
                        resource: r.id.to_string(),
                        status: Self::format_record_status(r.status),
                        serial: r.serial,
                        id: r
                            .value("id")
                            .map_or_else(String::new, |v| Self::truncate(&render_scalar(v), 24)),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a single state record.
    #[must_use]
    pub fn format_record(&self, record: &StateRecord) -> String {
        match self.format {
            OutputFormat::Json => pretty(record),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "{}", record.id.to_string().bold());
                let _ = writeln!(output, "   Status: {}", Self::format_record_status(record.status));
                let _ = writeln!(output, "   Serial: {}", record.serial);
                let _ = writeln!(
                    output,
                    "   Desired hash: {}",
                    ConfigHasher::short_hash(&record.desired_hash)
                );
                let _ = writeln!(output, "   Created: {}", record.created_at);
                let _ = writeln!(output, "   Updated: {}", record.updated_at);
                if !record.dependencies.is_empty() {
                    let deps: Vec<String> =
                        record.dependencies.iter().map(ToString::to_string).collect();
                    let _ = writeln!(output, "   Depends on: {}", deps.join(", "));
                }
                output.push_str("   Attributes:\n");
                for (name, value) in record.merged_attributes() {
                    let _ = writeln!(output, "     {name} = {value}");
                }
                output
            }
        }
    }

    /// Formats a run lock.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => pretty(lock),
            OutputFormat::Text => format!(
                "Locked by {} (lock {}, expires in {}s)\n",
                lock.holder,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats the result of validation.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &StackConfig,
        environment: &str,
        result: &ValidationResult,
        resources: usize,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => pretty(&json!({
                "valid": result.is_valid(),
                "project": config.project.name,
                "environment": environment,
                "resources": resources,
                "errors": result
                    .errors
                    .iter()
                    .map(|e| json!({ "field": e.field, "message": e.message }))
                    .collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid!", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {environment}");
                let _ = writeln!(output, "   Resources: {resources}");
                let _ = writeln!(output, "   Modules: {}", config.modules.len());
                output
            }
        }
    }

    /// Formats a plan action with color.
    fn format_action(entry: &PlanEntry) -> String {
        let label = format!("{}{}", entry.action.symbol(entry.replacement), entry.action);
        match (entry.action, entry.replacement) {
            (_, true) => label.magenta().to_string(),
            (Action::Create, false) => label.green().to_string(),
            (Action::Update, false) => label.yellow().to_string(),
            (Action::Destroy, false) => label.red().to_string(),
            (Action::NoOp, false) => label.dimmed().to_string(),
        }
    }

    /// Formats a step status with color.
    fn format_step_status(status: StepStatus) -> String {
        let label = status.to_string();
        match status {
            StepStatus::Succeeded => label.green().to_string(),
            StepStatus::Failed => label.red().to_string(),
            StepStatus::Skipped | StepStatus::Cancelled => label.yellow().to_string(),
            StepStatus::Unchanged | StepStatus::Planned => label.dimmed().to_string(),
        }
    }

    /// Formats a record status with color.
    fn format_record_status(status: RecordStatus) -> String {
        match status {
            RecordStatus::Confirmed => "confirmed".green().to_string(),
            RecordStatus::Pending => "pending".yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", "✓".green().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", "⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, glyph: String, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string(&json!({ "status": status, "message": message }))
                    .unwrap_or_default()
            }
            OutputFormat::Text => format!("{glyph} {message}"),
        }
    }
}

fn pretty<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceId;
    use crate::planner::Planner;
    use crate::graph::{AttrValue, Graph, ResourceNode};

    fn plan() -> Plan {
        let node = ResourceNode::new(ResourceId::root("network", "main"))
            .with_attribute("cidr", AttrValue::string("10.0.0.0/16"));
        let graph = Graph::new(vec![node], BTreeMap::new()).unwrap();
        Planner::new(&graph, Vec::new()).plan().unwrap()
    }

    #[test]
    fn test_plan_json_lists_changes() {
        colored::control::set_override(false);
        let output = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), false);
        let value: Value = serde_json::from_str(&output).unwrap();

        assert_eq!(value["summary"]["create"], 1);
        assert_eq!(value["changes"][0]["id"], "network.main");
        assert_eq!(value["changes"][0]["action"], "create");
    }

    #[test]
    fn test_plan_text_table() {
        colored::control::set_override(false);
        let output = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), true);

        assert!(output.contains("network.main"));
        assert!(output.contains("new resource"));
        assert!(output.contains("1 to create"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-very-long-value", 8), "a-ver...");
    }

    #[test]
    fn test_outputs_text() {
        let outputs = BTreeMap::from([
            (String::from("endpoint"), json!("http://api")),
            (String::from("replicas"), json!(3)),
        ]);
        let output = OutputFormatter::new(OutputFormat::Text).format_outputs(&outputs);
        assert_eq!(output, "endpoint = http://api\nreplicas = 3\n");
    }
}
