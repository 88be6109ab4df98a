//! Attribute-level diffing between recorded and planned state.
//!
//! The planner resolves each node's declared attributes into
//! [`PlannedValue`]s and compares them with the attributes last sent to the
//! provider, as stored in the node's state record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::trace;

use crate::graph::AttributeMap;

/// A planned attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PlannedValue {
    /// The value is known at plan time.
    Known(Value),
    /// The value depends on a resource that has not been applied yet.
    Unknown,
}

impl PlannedValue {
    /// Returns the value if it is known.
    #[must_use]
    pub const fn known(&self) -> Option<&Value> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unknown => None,
        }
    }

    /// Returns true if the value is only known after apply.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl From<Option<Value>> for PlannedValue {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Self::Unknown, Self::Known)
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{}", display_value(value)),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

/// Planned attributes of a node.
pub type PlannedAttributes = BTreeMap<String, PlannedValue>;

/// One changed attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Recorded value, if any.
    pub old: Option<Value>,
    /// Planned value; `None` when the attribute is removed.
    pub new: Option<PlannedValue>,
    /// Whether this change forces the resource to be replaced.
    pub forces_replacement: bool,
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let old = self
            .old
            .as_ref()
            .map_or_else(|| String::from("(none)"), display_value);
        let new = self
            .new
            .as_ref()
            .map_or_else(|| String::from("(removed)"), ToString::to_string);
        write!(f, "{}: {old} => {new}", self.attribute)?;
        if self.forces_replacement {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

/// Engine for computing attribute differences.
#[derive(Debug, Default)]
pub struct DiffEngine;

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Diffs planned attributes against the recorded desired attributes.
    ///
    /// Unknown values always count as changes. An attribute present in the
    /// record but no longer declared is reported as removed.
    #[must_use]
    pub fn compute_diff(
        &self,
        recorded: &AttributeMap,
        planned: &PlannedAttributes,
        replace_on_change: &BTreeSet<String>,
    ) -> Vec<AttributeChange> {
        let names: BTreeSet<&String> = recorded.keys().chain(planned.keys()).collect();
        let mut changes = Vec::new();

        for name in names {
            let old = recorded.get(name);
            let new = planned.get(name);

            let changed = match (old, new) {
                (Some(old), Some(PlannedValue::Known(new))) => old != new,
                (None, None) => false,
                _ => true,
            };

            if changed {
                trace!("Attribute {name} changed");
                changes.push(AttributeChange {
                    attribute: name.clone(),
                    old: old.cloned(),
                    new: new.cloned(),
                    forces_replacement: replace_on_change.contains(name),
                });
            }
        }

        changes
    }

    /// Lists every planned attribute as a change from nothing.
    #[must_use]
    pub fn creation_diff(&self, planned: &PlannedAttributes) -> Vec<AttributeChange> {
        planned
            .iter()
            .map(|(name, value)| AttributeChange {
                attribute: name.clone(),
                old: None,
                new: Some(value.clone()),
                forces_replacement: false,
            })
            .collect()
    }
}

fn display_value(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorded() -> AttributeMap {
        AttributeMap::from([
            (String::from("cidr"), json!("10.0.0.0/16")),
            (String::from("tags"), json!({"env": "dev"})),
        ])
    }

    fn planned(pairs: &[(&str, PlannedValue)]) -> PlannedAttributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_no_changes() {
        let engine = DiffEngine::new();
        let planned = planned(&[
            ("cidr", PlannedValue::Known(json!("10.0.0.0/16"))),
            ("tags", PlannedValue::Known(json!({"env": "dev"}))),
        ]);

        let changes = engine.compute_diff(&recorded(), &planned, &BTreeSet::new());
        assert!(changes.is_empty());
    }

    #[test]
    fn test_changed_attribute_forces_replacement() {
        let engine = DiffEngine::new();
        let planned = planned(&[
            ("cidr", PlannedValue::Known(json!("10.1.0.0/16"))),
            ("tags", PlannedValue::Known(json!({"env": "dev"}))),
        ]);
        let replace = BTreeSet::from([String::from("cidr")]);

        let changes = engine.compute_diff(&recorded(), &planned, &replace);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].attribute, "cidr");
        assert!(changes[0].forces_replacement);
        assert_eq!(changes[0].old, Some(json!("10.0.0.0/16")));
    }

    #[test]
    fn test_unknown_is_always_a_change() {
        let engine = DiffEngine::new();
        let planned = planned(&[
            ("cidr", PlannedValue::Unknown),
            ("tags", PlannedValue::Known(json!({"env": "dev"}))),
        ]);

        let changes = engine.compute_diff(&recorded(), &planned, &BTreeSet::new());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new, Some(PlannedValue::Unknown));
    }

    #[test]
    fn test_removed_and_added_attributes() {
        let engine = DiffEngine::new();
        let planned = planned(&[
            ("cidr", PlannedValue::Known(json!("10.0.0.0/16"))),
            ("name", PlannedValue::Known(json!("main"))),
        ]);

        let changes = engine.compute_diff(&recorded(), &planned, &BTreeSet::new());
        let names: Vec<_> = changes.iter().map(|c| c.attribute.as_str()).collect();
        assert_eq!(names, vec!["name", "tags"]);
        assert!(changes[1].new.is_none());
    }

    #[test]
    fn test_change_display() {
        let change = AttributeChange {
            attribute: String::from("subnet_id"),
            old: Some(json!("subnet-1")),
            new: Some(PlannedValue::Unknown),
            forces_replacement: true,
        };
        assert_eq!(
            change.to_string(),
            "subnet_id: \"subnet-1\" => (known after apply) (forces replacement)"
        );
    }
}
