//! Interpolation expression parsing.
//!
//! Attribute strings may embed `${...}` expressions. Three forms are
//! recognised:
//!
//! - `${var.NAME}`: a variable of the enclosing module
//! - `${TYPE.NAME.ATTR}`: an attribute of a resource in the same module
//! - `${module.CHILD.OUTPUT}`: an output of a child module
//!
//! `$${` escapes a literal `${`.

use std::fmt;

/// A parsed interpolation expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    /// `var.NAME`
    Variable(String),
    /// `TYPE.NAME.ATTR`
    Resource {
        /// Resource type.
        resource_type: String,
        /// Resource name.
        name: String,
        /// Referenced attribute.
        attribute: String,
    },
    /// `module.CHILD.OUTPUT`
    ModuleOutput {
        /// Child module name.
        module: String,
        /// Output name.
        output: String,
    },
}

/// A piece of an interpolated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Text(String),
    /// An expression to evaluate.
    Expr(Expression),
}

/// Splits a string into literal text and expressions.
///
/// # Errors
///
/// Returns a message describing the problem if an expression is unterminated
/// or malformed.
pub fn parse_segments(input: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(pos) = rest.find("${") {
        // `$${` is an escaped literal
        if pos > 0 && rest[..pos].ends_with('$') {
            text.push_str(&rest[..pos - 1]);
            text.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }

        text.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated expression in '{input}'"))?;

        if !text.is_empty() {
            segments.push(Segment::Text(std::mem::take(&mut text)));
        }
        segments.push(Segment::Expr(parse_expression(&after[..end])?));
        rest = &after[end + 1..];
    }

    text.push_str(rest);
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }

    Ok(segments)
}

/// Parses the body of a single `${...}` expression.
///
/// # Errors
///
/// Returns a message if the expression does not match a known form.
pub fn parse_expression(body: &str) -> Result<Expression, String> {
    let body = body.trim();
    let parts: Vec<&str> = body.split('.').collect();

    if let Some(bad) = parts.iter().find(|p| !is_identifier(p)) {
        return Err(format!("invalid identifier '{bad}' in expression '{body}'"));
    }

    match parts.as_slice() {
        ["var", name] => Ok(Expression::Variable((*name).to_string())),
        ["var", ..] => Err(format!("expected 'var.NAME', found '{body}'")),
        ["module", module, output] => Ok(Expression::ModuleOutput {
            module: (*module).to_string(),
            output: (*output).to_string(),
        }),
        ["module", ..] => Err(format!("expected 'module.NAME.OUTPUT', found '{body}'")),
        [resource_type, name, attribute] => Ok(Expression::Resource {
            resource_type: (*resource_type).to_string(),
            name: (*name).to_string(),
            attribute: (*attribute).to_string(),
        }),
        _ => Err(format!(
            "expected 'var.NAME', 'TYPE.NAME.ATTR' or 'module.NAME.OUTPUT', found '{body}'"
        )),
    }
}

/// Returns the child module names referenced anywhere in a raw value.
pub fn module_references(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            if let Ok(segments) = parse_segments(s) {
                for segment in segments {
                    if let Segment::Expr(Expression::ModuleOutput { module, .. }) = segment {
                        if !out.contains(&module) {
                            out.push(module);
                        }
                    }
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                module_references(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                module_references(item, out);
            }
        }
        _ => {}
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Variable(name) => write!(f, "var.{name}"),
            Self::Resource {
                resource_type,
                name,
                attribute,
            } => write!(f, "{resource_type}.{name}.{attribute}"),
            Self::ModuleOutput { module, output } => write!(f, "module.{module}.{output}"),
        }
    }
}
