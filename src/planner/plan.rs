//! Plan types.
//!
//! A [`Plan`] is an ordered list of [`PlanEntry`] values: every destroy
//! first (dependents before their dependencies), then creates, updates and
//! no-ops in topological order. Each entry carries the indices of the
//! entries it must wait for, which is all the executor needs to schedule it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ConfigError, Result, StratumError};
use crate::graph::{AttrValue, AttributeMap, ResourceId};

use super::diff::{AttributeChange, PlannedAttributes};

/// What happens to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Create a new resource.
    Create,
    /// Update an existing resource in place.
    Update,
    /// Destroy a resource.
    Destroy,
    /// Nothing to do.
    NoOp,
}

impl Action {
    /// Symbol used in text output.
    #[must_use]
    pub const fn symbol(self, replacement: bool) -> &'static str {
        match (self, replacement) {
            (Self::Create, true) => "+/-",
            (Self::Destroy, true) => "-/+",
            (Self::Create, false) => "+",
            (Self::Update, _) => "~",
            (Self::Destroy, false) => "-",
            (Self::NoOp, _) => " ",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

/// A single planned step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Resource address.
    pub id: ResourceId,
    /// Resource type.
    pub resource_type: String,
    /// Action to perform.
    pub action: Action,
    /// Whether this entry is half of a destroy-then-create pair.
    #[serde(default)]
    pub replacement: bool,
    /// Why the action was chosen.
    pub reason: String,
    /// Provider attributes recorded before the run.
    #[serde(default)]
    pub prior: Option<AttributeMap>,
    /// Record serial seen when planning; `None` if there was no record.
    #[serde(default)]
    pub prior_serial: Option<u64>,
    /// Attributes the resource will have after the step.
    #[serde(default)]
    pub planned: PlannedAttributes,
    /// Attribute-level diff.
    #[serde(default)]
    pub changes: Vec<AttributeChange>,
    /// Declared attribute expressions, resolved again at apply time.
    #[serde(default)]
    pub config: BTreeMap<String, AttrValue>,
    /// Resources this resource depends on.
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    /// Indices of entries that must complete first.
    #[serde(default)]
    pub wait_for: Vec<usize>,
}

impl PlanEntry {
    /// Returns true if the entry changes anything.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.action != Action::NoOp
    }

    /// Returns a human-readable description of the entry.
    #[must_use]
    pub fn description(&self) -> String {
        match (self.action, self.replacement) {
            (Action::Create, true) => format!("Replace '{}' (create)", self.id),
            (Action::Destroy, true) => format!("Replace '{}' (destroy)", self.id),
            (Action::Create, false) => format!("Create '{}'", self.id),
            (Action::Update, _) => format!("Update '{}'", self.id),
            (Action::Destroy, false) => format!("Destroy '{}'", self.id),
            (Action::NoOp, _) => format!("No change for '{}'", self.id),
        }
    }
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.symbol(self.replacement), self.id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

/// Counts of planned changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create, replacements excluded.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to destroy, replacements excluded.
    pub destroy: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources left unchanged.
    pub unchanged: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
            self.create, self.update, self.replace, self.destroy, self.unchanged
        )
    }
}

/// One row of the reviewable plan export.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewEntry<'a> {
    /// Resource address.
    pub id: &'a ResourceId,
    /// Action to perform.
    pub action: Action,
    /// Whether this entry is half of a replacement.
    pub replacement: bool,
    /// Why the action was chosen.
    pub reason: &'a str,
    /// Attribute-level diff.
    pub diff: &'a [AttributeChange],
}

/// An ordered change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the configuration inputs this plan is based on.
    pub config_hash: String,
    /// Environment the plan was made for.
    pub environment: String,
    /// Whether this plan tears everything down.
    #[serde(default)]
    pub destroy: bool,
    /// Entries in execution order.
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    /// Returns the change counts.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match (entry.action, entry.replacement) {
                (Action::Create, true) => summary.replace += 1,
                (Action::Create, false) => summary.create += 1,
                (Action::Update, _) => summary.update += 1,
                (Action::Destroy, false) => summary.destroy += 1,
                (Action::Destroy, true) => {}
                (Action::NoOp, _) => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Returns true if any entry changes something.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(PlanEntry::is_change)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the plan has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the entry for a resource and action.
    #[must_use]
    pub fn entry(&self, id: &ResourceId, action: Action) -> Option<(usize, &PlanEntry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.id == *id && e.action == action)
    }

    /// Entries that change something, in order.
    #[must_use]
    pub fn changes(&self) -> Vec<&PlanEntry> {
        self.entries.iter().filter(|e| e.is_change()).collect()
    }

    /// The reviewable export: `{id, action, replacement, reason, diff}` per
    /// changing entry.
    #[must_use]
    pub fn review(&self) -> Vec<ReviewEntry<'_>> {
        self.changes()
            .into_iter()
            .map(|e| ReviewEntry {
                id: &e.id,
                action: e.action,
                replacement: e.replacement,
                reason: &e.reason,
                diff: &e.changes,
            })
            .collect()
    }

    /// Serializes the full plan for a later `apply`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StratumError::internal(format!("Failed to serialize plan: {e}")))
    }

    /// Loads a plan written by [`Plan::to_json`].
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError::ParseError` if the content is not a plan.
    pub fn from_json(content: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(content).map_err(|e| ConfigError::ParseError {
            message: format!("invalid plan file: {e}"),
            location: Some(format!("line {}", e.line())),
        })?;

        for (i, entry) in plan.entries.iter().enumerate() {
            if entry.wait_for.iter().any(|&w| w >= i) {
                return Err(ConfigError::ParseError {
                    message: format!("entry {i} ({}) waits for a later entry", entry.id),
                    location: None,
                }
                .into());
            }
        }

        Ok(plan)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes. Infrastructure matches the configuration.");
        }

        writeln!(f, "Plan ({}):", self.environment)?;
        for entry in self.changes() {
            writeln!(f, "  {entry}")?;
            for change in &entry.changes {
                writeln!(f, "      {change}")?;
            }
        }
        write!(f, "\n{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, action: Action, replacement: bool, wait_for: Vec<usize>) -> PlanEntry {
        PlanEntry {
            id: ResourceId::root("network", name),
            resource_type: String::from("network"),
            action,
            replacement,
            reason: String::new(),
            prior: None,
            prior_serial: None,
            planned: PlannedAttributes::new(),
            changes: Vec::new(),
            config: BTreeMap::new(),
            dependencies: Vec::new(),
            wait_for,
        }
    }

    fn plan(entries: Vec<PlanEntry>) -> Plan {
        Plan {
            created_at: Utc::now(),
            config_hash: String::from("abc"),
            environment: String::from("dev"),
            destroy: false,
            entries,
        }
    }

    #[test]
    fn test_summary_counts_replacements_once() {
        let plan = plan(vec![
            entry("old", Action::Destroy, false, vec![]),
            entry("a", Action::Destroy, true, vec![]),
            entry("a", Action::Create, true, vec![1]),
            entry("b", Action::Create, false, vec![]),
            entry("c", Action::Update, false, vec![]),
            entry("d", Action::NoOp, false, vec![]),
        ]);

        let summary = plan.summary();
        assert_eq!(summary.create, 1);
        assert_eq!(summary.update, 1);
        assert_eq!(summary.destroy, 1);
        assert_eq!(summary.replace, 1);
        assert_eq!(summary.unchanged, 1);
        assert!(plan.has_changes());
    }

    #[test]
    fn test_noop_plan_has_no_changes() {
        let plan = plan(vec![entry("a", Action::NoOp, false, vec![])]);
        assert!(!plan.has_changes());
        assert!(plan.review().is_empty());
        assert!(plan.to_string().starts_with("No changes"));
    }

    #[test]
    fn test_json_roundtrip() {
        let plan = plan(vec![
            entry("a", Action::Create, false, vec![]),
            entry("b", Action::Update, false, vec![0]),
        ]);
        let json = plan.to_json().unwrap();
        assert!(json.contains("\"action\": \"create\""));

        let loaded = Plan::from_json(&json).unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn test_from_json_rejects_forward_waits() {
        let plan = plan(vec![
            entry("a", Action::Create, false, vec![1]),
            entry("b", Action::Create, false, vec![]),
        ]);
        let json = plan.to_json().unwrap();
        assert!(Plan::from_json(&json).is_err());
    }

    #[test]
    fn test_entry_display() {
        let mut e = entry("a", Action::Create, true, vec![]);
        e.reason = String::from("cidr forces replacement");
        assert_eq!(e.to_string(), "+/- network.a (cidr forces replacement)");
        assert_eq!(Action::NoOp.to_string(), "no-op");
    }
}
