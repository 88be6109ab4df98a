//! Resource graph construction.
//!
//! This module turns a stack configuration into a flattened, acyclic graph:
//! - Parsing `${...}` interpolation expressions
//! - Instantiating nested modules with prefixed resource ids
//! - Tracking references and explicit dependencies as edges
//! - Rejecting dependency cycles

mod builder;
mod expr;
mod node;
mod value;

pub use builder::GraphBuilder;
pub use expr::{Expression, Segment, parse_expression, parse_segments};
pub use node::{Graph, ID_ATTRIBUTE, ResourceId, ResourceNode};
pub use value::{AttrValue, AttributeMap, Reference, TemplatePart, render_scalar};
