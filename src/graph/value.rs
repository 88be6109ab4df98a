//! Attribute values and references.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::node::ResourceId;

/// Concrete attribute values, as sent to and returned by providers.
pub type AttributeMap = BTreeMap<String, Value>;

/// A pointer to another node's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// The referenced resource.
    pub target: ResourceId,
    /// The referenced attribute.
    pub attribute: String,
}

impl Reference {
    /// Creates a new reference.
    #[must_use]
    pub fn new(target: ResourceId, attribute: impl Into<String>) -> Self {
        Self {
            target,
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// Part of a string template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TemplatePart {
    /// Literal text.
    Text(String),
    /// A reference whose value is spliced into the string.
    Reference(Reference),
}

/// A declared attribute value.
///
/// Reference-free subtrees are always `Literal`; `List` and `Map` only
/// appear when some nested element carries a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    /// A concrete value.
    Literal(Value),
    /// The whole value of another node's attribute.
    Reference(Reference),
    /// A string with embedded references.
    Template(Vec<TemplatePart>),
    /// A list with at least one reference inside.
    List(Vec<AttrValue>),
    /// A map with at least one reference inside.
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    /// Creates a literal string value.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::Literal(Value::String(value.into()))
    }

    /// Creates a reference value.
    #[must_use]
    pub fn reference(target: ResourceId, attribute: impl Into<String>) -> Self {
        Self::Reference(Reference::new(target, attribute))
    }

    /// Returns the literal value, if this value carries no references.
    #[must_use]
    pub const fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Collects every reference in this value.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(reference) => out.push(reference),
            Self::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Reference(reference) = part {
                        out.push(reference);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Resolves this value to a concrete one.
    ///
    /// `lookup` returns `Ok(Some(value))` for a known reference and
    /// `Ok(None)` when the value is not known yet; an unknown reference
    /// anywhere makes the whole value unknown.
    ///
    /// # Errors
    ///
    /// Propagates errors returned by `lookup`.
    pub fn resolve<E, F>(&self, lookup: &mut F) -> Result<Option<Value>, E>
    where
        F: FnMut(&Reference) -> Result<Option<Value>, E>,
    {
        match self {
            Self::Literal(value) => Ok(Some(value.clone())),
            Self::Reference(reference) => lookup(reference),
            Self::Template(parts) => {
                let mut rendered = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => rendered.push_str(text),
                        TemplatePart::Reference(reference) => match lookup(reference)? {
                            Some(value) => rendered.push_str(&render_scalar(&value)),
                            None => return Ok(None),
                        },
                    }
                }
                Ok(Some(Value::String(rendered)))
            }
            Self::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    match item.resolve(lookup)? {
                        Some(value) => resolved.push(value),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Array(resolved)))
            }
            Self::Map(entries) => {
                let mut resolved = serde_json::Map::new();
                for (key, item) in entries {
                    match item.resolve(lookup)? {
                        Some(value) => {
                            resolved.insert(key.clone(), value);
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Object(resolved)))
            }
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value}"),
            Self::Reference(reference) => write!(f, "${{{reference}}}"),
            Self::Template(parts) => {
                f.write_str("\"")?;
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => f.write_str(text)?,
                        TemplatePart::Reference(reference) => write!(f, "${{{reference}}}")?,
                    }
                }
                f.write_str("\"")
            }
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Renders a scalar for string interpolation. Strings are inserted without
/// quotes, `null` as the empty string.
#[must_use]
pub fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
