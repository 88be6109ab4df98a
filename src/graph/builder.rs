//! Builds the flattened resource graph from a stack configuration.
//!
//! Modules are instantiated recursively: each resource is prefixed with its
//! module path, variable references are replaced by the values the parent
//! passed in, and module outputs are substituted where the parent uses them.
//! The result is a single graph with no module boundaries left.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use super::expr::{Expression, Segment, module_references, parse_segments};
use super::node::{Graph, ResourceId, ResourceNode};
use super::value::{AttrValue, Reference, TemplatePart, render_scalar};
use crate::config::{ModuleConfig, ResourceConfig, StackConfig};
use crate::error::{ConfigError, CycleError, Result};

/// Evaluated outputs of each instantiated child module.
type ModuleOutputs = BTreeMap<String, BTreeMap<String, AttrValue>>;

/// Builds a [`Graph`] from a [`StackConfig`].
#[derive(Debug, Clone)]
pub struct GraphBuilder<'a> {
    config: &'a StackConfig,
    environment: String,
    overrides: BTreeMap<String, Value>,
}

/// The parts of a module the builder walks.
#[derive(Clone, Copy)]
struct ModuleBody<'c> {
    resources: &'c [ResourceConfig],
    modules: &'c [ModuleConfig],
    outputs: &'c BTreeMap<String, Value>,
}

/// Evaluation scope of one module instance.
struct Scope<'s> {
    path: &'s [String],
    variables: &'s BTreeMap<String, AttrValue>,
    resources: &'s BTreeSet<String>,
    module_outputs: &'s ModuleOutputs,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder for the configuration's own environment.
    #[must_use]
    pub fn new(config: &'a StackConfig) -> Self {
        Self {
            config,
            environment: config.project.environment.clone(),
            overrides: BTreeMap::new(),
        }
    }

    /// Selects the environment whose variable overlay applies.
    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Overrides a root variable. Overrides win over environment overlays.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(name.into(), value);
        self
    }

    /// Overrides several root variables.
    #[must_use]
    pub fn variables(mut self, values: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.overrides.extend(values);
        self
    }

    /// Builds the flattened graph.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for invalid references, undefined variables or
    /// duplicate names, and a `CycleError` if resources or modules depend on
    /// each other in a loop.
    pub fn build(&self) -> Result<Graph> {
        let mut values = self.config.variable_values(&self.environment);
        values.extend(self.overrides.clone());
        let scope: BTreeMap<String, AttrValue> = values
            .into_iter()
            .map(|(name, value)| (name, AttrValue::Literal(value)))
            .collect();

        let root = ModuleBody {
            resources: &self.config.resources,
            modules: &self.config.modules,
            outputs: &self.config.outputs,
        };

        let mut placed = Vec::new();
        let outputs = Self::instantiate(&[], &[], root, &scope, &mut placed)?;

        placed.sort_by(|a, b| a.0.cmp(&b.0));
        let nodes: Vec<ResourceNode> = placed.into_iter().map(|(_, node)| node).collect();

        check_attributes(&nodes, &outputs)?;

        let graph = Graph::new(nodes, outputs)?;
        debug!(
            resources = graph.len(),
            environment = %self.environment,
            "Built resource graph"
        );
        Ok(graph)
    }

    /// Instantiates one module and returns its evaluated outputs.
    ///
    /// `key` orders nodes by declaration: a module's own resources come
    /// before its child modules, children in declaration order.
    fn instantiate(
        path: &[String],
        key: &[usize],
        body: ModuleBody<'_>,
        variables: &BTreeMap<String, AttrValue>,
        placed: &mut Vec<(Vec<usize>, ResourceNode)>,
    ) -> Result<BTreeMap<String, AttrValue>> {
        let mut resources = BTreeSet::new();
        for resource in body.resources {
            if !resources.insert(resource.address()) {
                return Err(ConfigError::DuplicateName {
                    kind: String::from("resource"),
                    name: ResourceId::new(path.to_vec(), &resource.resource_type, &resource.name)
                        .to_string(),
                }
                .into());
            }
        }

        let mut module_names = BTreeSet::new();
        for module in body.modules {
            if !module_names.insert(module.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: String::from("module"),
                    name: module_address(path, &module.name),
                }
                .into());
            }
        }

        let mut module_outputs = ModuleOutputs::new();
        for i in module_order(path, body.modules)? {
            let module = &body.modules[i];
            let child_path: Vec<String> = path
                .iter()
                .cloned()
                .chain(std::iter::once(module.name.clone()))
                .collect();

            let scope = Scope {
                path,
                variables,
                resources: &resources,
                module_outputs: &module_outputs,
            };

            let mut child_variables: BTreeMap<String, AttrValue> = module
                .variables
                .iter()
                .filter_map(|(name, var)| {
                    var.default
                        .clone()
                        .map(|v| (name.clone(), AttrValue::Literal(v)))
                })
                .collect();
            for (name, raw) in &module.inputs {
                let location = format!("input '{name}' of {}", module_address(path, &module.name));
                child_variables.insert(name.clone(), scope.eval(raw, &location)?);
            }

            let mut child_key = key.to_vec();
            child_key.push(body.resources.len() + i);

            let child_body = ModuleBody {
                resources: &module.resources,
                modules: &module.modules,
                outputs: &module.outputs,
            };
            let outputs =
                Self::instantiate(&child_path, &child_key, child_body, &child_variables, placed)?;
            module_outputs.insert(module.name.clone(), outputs);
        }

        let scope = Scope {
            path,
            variables,
            resources: &resources,
            module_outputs: &module_outputs,
        };

        for (i, resource) in body.resources.iter().enumerate() {
            let id = ResourceId::new(path.to_vec(), &resource.resource_type, &resource.name);
            let mut node = ResourceNode::new(id.clone());

            for (name, raw) in &resource.attributes {
                let location = format!("attribute '{name}' of {id}");
                node.attributes.insert(name.clone(), scope.eval(raw, &location)?);
            }
            node.computed.extend(resource.computed.iter().cloned());
            node.replace_on_change
                .extend(resource.replace_on_change.iter().cloned());

            for entry in &resource.depends_on {
                let location = format!("depends_on of {id}");
                if let Some(module) = entry.strip_prefix("module.") {
                    if !module_names.contains(module) {
                        return Err(ConfigError::UnknownResource {
                            target: entry.clone(),
                            location,
                        }
                        .into());
                    }
                    let module_path: Vec<String> = path
                        .iter()
                        .cloned()
                        .chain(std::iter::once(module.to_string()))
                        .collect();
                    node.depends_on.extend(
                        placed
                            .iter()
                            .filter(|(_, n)| n.id.is_within(&module_path))
                            .map(|(_, n)| n.id.clone()),
                    );
                } else {
                    match entry.split_once('.') {
                        Some((resource_type, name)) if resources.contains(entry) => {
                            node.depends_on
                                .insert(ResourceId::new(path.to_vec(), resource_type, name));
                        }
                        _ => {
                            return Err(ConfigError::UnknownResource {
                                target: entry.clone(),
                                location,
                            }
                            .into());
                        }
                    }
                }
            }

            let mut node_key = key.to_vec();
            node_key.push(i);
            placed.push((node_key, node));
        }

        let mut outputs = BTreeMap::new();
        for (name, raw) in body.outputs {
            let location = if path.is_empty() {
                format!("output '{name}'")
            } else {
                format!("output '{name}' of {}", module_address(path, ""))
            };
            outputs.insert(name.clone(), scope.eval(raw, &location)?);
        }

        Ok(outputs)
    }
}

impl Scope<'_> {
    fn eval(&self, raw: &Value, location: &str) -> Result<AttrValue> {
        match raw {
            Value::String(s) => self.eval_string(s, location),
            Value::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item, location))
                    .collect::<Result<Vec<_>>>()?;
                if values.iter().all(|v| v.as_literal().is_some()) {
                    Ok(AttrValue::Literal(Value::Array(
                        values.into_iter().filter_map(into_literal).collect(),
                    )))
                } else {
                    Ok(AttrValue::List(values))
                }
            }
            Value::Object(map) => {
                let entries = map
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), self.eval(item, location)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?;
                if entries.values().all(|v| v.as_literal().is_some()) {
                    Ok(AttrValue::Literal(Value::Object(
                        entries
                            .into_iter()
                            .filter_map(|(k, v)| into_literal(v).map(|v| (k, v)))
                            .collect(),
                    )))
                } else {
                    Ok(AttrValue::Map(entries))
                }
            }
            other => Ok(AttrValue::Literal(other.clone())),
        }
    }

    fn eval_string(&self, raw: &str, location: &str) -> Result<AttrValue> {
        let segments = parse_segments(raw).map_err(|message| ConfigError::InvalidExpression {
            expression: raw.to_string(),
            location: location.to_string(),
            message,
        })?;

        if let [Segment::Expr(expr)] = segments.as_slice() {
            return self.eval_expr(expr, location);
        }

        let mut parts = Vec::new();
        for segment in segments {
            match segment {
                Segment::Text(text) => push_text(&mut parts, &text),
                Segment::Expr(expr) => match self.eval_expr(&expr, location)? {
                    AttrValue::Literal(Value::Array(_) | Value::Object(_))
                    | AttrValue::List(_)
                    | AttrValue::Map(_) => {
                        return Err(ConfigError::InvalidExpression {
                            expression: raw.to_string(),
                            location: location.to_string(),
                            message: format!("'{expr}' is a list or map and cannot be interpolated into a string"),
                        }
                        .into());
                    }
                    AttrValue::Literal(value) => push_text(&mut parts, &render_scalar(&value)),
                    AttrValue::Reference(reference) => parts.push(TemplatePart::Reference(reference)),
                    AttrValue::Template(inner) => {
                        for part in inner {
                            match part {
                                TemplatePart::Text(text) => push_text(&mut parts, &text),
                                reference @ TemplatePart::Reference(_) => parts.push(reference),
                            }
                        }
                    }
                },
            }
        }

        if parts.iter().all(|p| matches!(p, TemplatePart::Text(_))) {
            let text: String = parts
                .into_iter()
                .filter_map(|p| match p {
                    TemplatePart::Text(text) => Some(text),
                    TemplatePart::Reference(_) => None,
                })
                .collect();
            Ok(AttrValue::string(text))
        } else {
            Ok(AttrValue::Template(parts))
        }
    }

    fn eval_expr(&self, expr: &Expression, location: &str) -> Result<AttrValue> {
        match expr {
            Expression::Variable(name) => self.variables.get(name).cloned().ok_or_else(|| {
                ConfigError::UndefinedVariable {
                    name: name.clone(),
                    location: location.to_string(),
                }
                .into()
            }),
            Expression::Resource {
                resource_type,
                name,
                attribute,
            } => {
                let target = ResourceId::new(self.path.to_vec(), resource_type, name);
                if self.resources.contains(&format!("{resource_type}.{name}")) {
                    Ok(AttrValue::reference(target, attribute))
                } else {
                    Err(ConfigError::UnknownResource {
                        target: target.to_string(),
                        location: location.to_string(),
                    }
                    .into())
                }
            }
            Expression::ModuleOutput { module, output } => self
                .module_outputs
                .get(module)
                .and_then(|outputs| outputs.get(output))
                .cloned()
                .ok_or_else(|| {
                    ConfigError::UnknownModuleOutput {
                        module: module.clone(),
                        output: output.clone(),
                        location: location.to_string(),
                    }
                    .into()
                }),
        }
    }
}

fn into_literal(value: AttrValue) -> Option<Value> {
    match value {
        AttrValue::Literal(value) => Some(value),
        _ => None,
    }
}

fn push_text(parts: &mut Vec<TemplatePart>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(TemplatePart::Text(last)) = parts.last_mut() {
        last.push_str(text);
    } else {
        parts.push(TemplatePart::Text(text.to_string()));
    }
}

fn module_address(path: &[String], name: &str) -> String {
    path.iter()
        .map(String::as_str)
        .chain((!name.is_empty()).then_some(name))
        .map(|m| format!("module.{m}"))
        .collect::<Vec<_>>()
        .join(".")
}

/// Orders sibling modules so every module comes after the siblings its
/// inputs read outputs from.
fn module_order(path: &[String], modules: &[ModuleConfig]) -> Result<Vec<usize>> {
    let position: HashMap<&str, usize> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name.as_str(), i))
        .collect();

    let requires: Vec<Vec<usize>> = modules
        .iter()
        .map(|module| {
            let mut names = Vec::new();
            for raw in module.inputs.values() {
                module_references(raw, &mut names);
            }
            names
                .iter()
                .filter_map(|name| position.get(name.as_str()).copied())
                .collect()
        })
        .collect();

    let mut done = vec![false; modules.len()];
    let mut order = Vec::with_capacity(modules.len());
    while order.len() < modules.len() {
        let next = (0..modules.len()).find(|&i| !done[i] && requires[i].iter().all(|&r| done[r]));
        match next {
            Some(i) => {
                done[i] = true;
                order.push(i);
            }
            None => {
                return Err(module_cycle(path, modules, &requires, &done).into());
            }
        }
    }

    Ok(order)
}

fn module_cycle(
    path: &[String],
    modules: &[ModuleConfig],
    requires: &[Vec<usize>],
    done: &[bool],
) -> CycleError {
    let mut walk: Vec<usize> = Vec::new();
    let mut current = (0..modules.len()).find(|&i| !done[i]).unwrap_or(0);

    loop {
        if let Some(start) = walk.iter().position(|&w| w == current) {
            let mut cycle: Vec<String> = walk[start..]
                .iter()
                .map(|&i| module_address(path, &modules[i].name))
                .collect();
            cycle.push(module_address(path, &modules[current].name));
            return CycleError { path: cycle };
        }
        walk.push(current);
        match requires[current].iter().find(|&&r| !done[r]) {
            Some(&next) => current = next,
            None => {
                return CycleError {
                    path: walk
                        .iter()
                        .map(|&i| module_address(path, &modules[i].name))
                        .collect(),
                };
            }
        }
    }
}

/// Every reference must name an attribute its target declares or computes.
fn check_attributes(nodes: &[ResourceNode], outputs: &BTreeMap<String, AttrValue>) -> Result<()> {
    let by_id: HashMap<&ResourceId, &ResourceNode> = nodes.iter().map(|n| (&n.id, n)).collect();

    let check = |reference: &Reference, location: String| -> Result<()> {
        match by_id.get(&reference.target) {
            None => Err(ConfigError::UnknownResource {
                target: reference.target.to_string(),
                location,
            }
            .into()),
            Some(target) if !target.exposes(&reference.attribute) => {
                Err(ConfigError::UnknownAttribute {
                    target: reference.target.to_string(),
                    attribute: reference.attribute.clone(),
                    location,
                }
                .into())
            }
            Some(_) => Ok(()),
        }
    };

    for node in nodes {
        for (name, value) in &node.attributes {
            for reference in value.references() {
                check(reference, format!("attribute '{name}' of {}", node.id))?;
            }
        }
    }
    for (name, value) in outputs {
        for reference in value.references() {
            check(reference, format!("output '{name}'"))?;
        }
    }
    Ok(())
}
