//! Resource identifiers, nodes and the flattened dependency graph.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use super::value::{AttrValue, Reference};
use crate::error::{ConfigError, CycleError, Result};

/// Attribute every resource exposes once it exists.
pub const ID_ATTRIBUTE: &str = "id";

/// Fully-qualified resource address.
///
/// Rendered as `module.<m1>.module.<m2>.<type>.<name>`; resources of the
/// root module render as `<type>.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Enclosing module names, outermost first.
    pub module_path: Vec<String>,
    /// Resource type, e.g. `network`.
    pub resource_type: String,
    /// Resource name, unique per type within its module.
    pub name: String,
}

impl ResourceId {
    /// Creates an id in the given module path.
    #[must_use]
    pub fn new(
        module_path: Vec<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            module_path,
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Creates an id in the root module.
    #[must_use]
    pub fn root(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Vec::new(), resource_type, name)
    }

    /// Returns true if this resource lives at or below the given module path.
    #[must_use]
    pub fn is_within(&self, module_path: &[String]) -> bool {
        self.module_path.starts_with(module_path)
    }

    /// Parses a rendered address.
    ///
    /// # Errors
    ///
    /// Returns a message if the address is malformed.
    pub fn parse(address: &str) -> std::result::Result<Self, String> {
        let parts: Vec<&str> = address.split('.').collect();
        let mut module_path = Vec::new();
        let mut rest = parts.as_slice();

        while let ["module", name, tail @ ..] = rest {
            if tail.is_empty() {
                break;
            }
            module_path.push((*name).to_string());
            rest = tail;
        }

        match rest {
            [resource_type, name] if !resource_type.is_empty() && !name.is_empty() => {
                Ok(Self::new(module_path, *resource_type, *name))
            }
            _ => Err(format!(
                "invalid resource address '{address}', expected [module.NAME.]TYPE.NAME"
            )),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for module in &self.module_path {
            write!(f, "module.{module}.")?;
        }
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// A single resource in the flattened graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Resource address.
    pub id: ResourceId,
    /// Declared attributes.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Attributes assigned by the provider. Always contains `id`.
    pub computed: BTreeSet<String>,
    /// Attributes whose change forces destroy-then-create.
    pub replace_on_change: BTreeSet<String>,
    /// Explicit dependencies in addition to references.
    pub depends_on: BTreeSet<ResourceId>,
    dependencies: BTreeSet<ResourceId>,
    declaration: usize,
}

impl ResourceNode {
    /// Creates a node with no attributes.
    #[must_use]
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            computed: BTreeSet::from([ID_ATTRIBUTE.to_string()]),
            replace_on_change: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            declaration: 0,
        }
    }

    /// Adds a declared attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Marks an attribute as provider-computed.
    #[must_use]
    pub fn with_computed(mut self, name: impl Into<String>) -> Self {
        self.computed.insert(name.into());
        self
    }

    /// Marks an attribute as forcing replacement when it changes.
    #[must_use]
    pub fn with_replace_on_change(mut self, name: impl Into<String>) -> Self {
        self.replace_on_change.insert(name.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_depends_on(mut self, id: ResourceId) -> Self {
        self.depends_on.insert(id);
        self
    }

    /// Resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.id.resource_type
    }

    /// Nodes this node depends on, through references or `depends_on`.
    #[must_use]
    pub const fn dependencies(&self) -> &BTreeSet<ResourceId> {
        &self.dependencies
    }

    /// Position of the node in declaration order.
    #[must_use]
    pub const fn declaration(&self) -> usize {
        self.declaration
    }

    /// Returns true if the node declares or computes the attribute.
    #[must_use]
    pub fn exposes(&self, attribute: &str) -> bool {
        self.attributes.contains_key(attribute) || self.computed.contains(attribute)
    }

    /// Every reference held in this node's attributes.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.attributes.values().flat_map(AttrValue::references)
    }
}

/// The flattened, acyclic resource graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<ResourceNode>,
    index: HashMap<ResourceId, usize>,
    dependents: Vec<Vec<usize>>,
    outputs: BTreeMap<String, AttrValue>,
}

impl Graph {
    /// Creates a graph with no resources.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a graph from nodes in declaration order.
    ///
    /// References to resources outside the graph are kept but produce no
    /// edge; the planner resolves them from state.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` on duplicate ids or an explicit dependency on
    /// an unknown resource, and a `CycleError` if the dependencies loop.
    pub fn new(mut nodes: Vec<ResourceNode>, outputs: BTreeMap<String, AttrValue>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter_mut().enumerate() {
            node.declaration = i;
            if index.insert(node.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateName {
                    kind: String::from("resource"),
                    name: node.id.to_string(),
                }
                .into());
            }
        }

        for node in &mut nodes {
            let mut dependencies: BTreeSet<ResourceId> = node
                .references()
                .filter(|r| index.contains_key(&r.target))
                .map(|r| r.target.clone())
                .collect();

            for explicit in &node.depends_on {
                if !index.contains_key(explicit) {
                    return Err(ConfigError::UnknownResource {
                        target: explicit.to_string(),
                        location: format!("depends_on of {}", node.id),
                    }
                    .into());
                }
                dependencies.insert(explicit.clone());
            }
            node.dependencies = dependencies;
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.dependencies {
                if let Some(&d) = index.get(dep) {
                    dependents[d].push(i);
                }
            }
        }

        let graph = Self {
            nodes,
            index,
            dependents,
            outputs,
        };

        if let Some(path) = graph.find_cycle() {
            return Err(CycleError {
                path: path.iter().map(ToString::to_string).collect(),
            }
            .into());
        }

        Ok(graph)
    }

    /// Nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Returns true if the graph contains the id.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root module outputs.
    #[must_use]
    pub const fn outputs(&self) -> &BTreeMap<String, AttrValue> {
        &self.outputs
    }

    /// Nodes that directly depend on the given node.
    #[must_use]
    pub fn dependents(&self, id: &ResourceId) -> Vec<&ResourceNode> {
        self.index
            .get(id)
            .map(|&i| self.dependents[i].iter().map(|&d| &self.nodes[d]).collect())
            .unwrap_or_default()
    }

    /// Nodes in dependency order, ties broken by declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&ResourceNode> {
        let mut remaining: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.dependencies.len())
            .collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = ready.pop_first() {
            order.push(&self.nodes[i]);
            for &dependent in &self.dependents[i] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        order
    }

    /// Finds a dependency loop, returned with its first node repeated at the end.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<ResourceId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            graph: &Graph,
            i: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<ResourceId>> {
            marks[i] = Mark::Active;
            stack.push(i);

            let mut deps: Vec<usize> = graph.nodes[i]
                .dependencies
                .iter()
                .filter_map(|d| graph.index.get(d).copied())
                .collect();
            deps.sort_unstable();

            for d in deps {
                match marks[d] {
                    Mark::Active => {
                        let start = stack.iter().position(|&s| s == d).unwrap_or(0);
                        let mut path: Vec<ResourceId> = stack[start..]
                            .iter()
                            .map(|&s| graph.nodes[s].id.clone())
                            .collect();
                        path.push(graph.nodes[d].id.clone());
                        return Some(path);
                    }
                    Mark::New => {
                        if let Some(path) = visit(graph, d, marks, stack) {
                            return Some(path);
                        }
                    }
                    Mark::Done => {}
                }
            }

            stack.pop();
            marks[i] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        let mut stack = Vec::new();
        for i in 0..self.nodes.len() {
            if marks[i] != Mark::New {
                continue;
            }
            if let Some(path) = visit(self, i, &mut marks, &mut stack) {
                return Some(path);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StratumError;
    use serde_json::json;

    fn id(t: &str, n: &str) -> ResourceId {
        ResourceId::root(t, n)
    }

    #[test]
    fn test_resource_id_display_and_parse() {
        let root = id("network", "main");
        assert_eq!(root.to_string(), "network.main");

        let nested = ResourceId::new(
            vec![String::from("app"), String::from("db")],
            "instance",
            "primary",
        );
        assert_eq!(nested.to_string(), "module.app.module.db.instance.primary");
        assert_eq!(ResourceId::parse(&nested.to_string()).unwrap(), nested);
        assert_eq!(ResourceId::parse("network.main").unwrap(), root);

        assert!(ResourceId::parse("network").is_err());
        assert!(ResourceId::parse("module.app.network").is_err());
        assert!(ResourceId::parse("a.b.c").is_err());
    }

    #[test]
    fn test_resource_id_serde() {
        let nested = ResourceId::new(vec![String::from("app")], "service", "api");
        let json = serde_json::to_string(&nested).unwrap();
        assert_eq!(json, "\"module.app.service.api\"");
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, nested);
    }

    #[test]
    fn test_topological_order_ties_by_declaration() {
        let nodes = vec![
            ResourceNode::new(id("service", "api"))
                .with_attribute("subnet", AttrValue::reference(id("subnet", "a"), "id")),
            ResourceNode::new(id("subnet", "a"))
                .with_attribute("network", AttrValue::reference(id("network", "main"), "id")),
            ResourceNode::new(id("network", "main"))
                .with_attribute("cidr", AttrValue::Literal(json!("10.0.0.0/16"))),
            ResourceNode::new(id("bucket", "logs")),
        ];
        let graph = Graph::new(nodes, BTreeMap::new()).unwrap();

        let order: Vec<String> = graph
            .topological_order()
            .iter()
            .map(|n| n.id.to_string())
            .collect();
        assert_eq!(
            order,
            vec!["network.main", "subnet.a", "service.api", "bucket.logs"]
        );

        let dependents = graph.dependents(&id("network", "main"));
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, id("subnet", "a"));
    }

    #[test]
    fn test_cycle_rejected() {
        let nodes = vec![
            ResourceNode::new(id("a", "one"))
                .with_attribute("x", AttrValue::reference(id("b", "two"), "id")),
            ResourceNode::new(id("b", "two"))
                .with_attribute("x", AttrValue::reference(id("c", "three"), "id")),
            ResourceNode::new(id("c", "three")).with_depends_on(id("a", "one")),
        ];
        let err = Graph::new(nodes, BTreeMap::new()).unwrap_err();
        match err {
            StratumError::Cycle(cycle) => {
                assert_eq!(
                    cycle.path,
                    vec!["a.one", "b.two", "c.three", "a.one"]
                );
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let nodes = vec![
            ResourceNode::new(id("a", "one"))
                .with_attribute("x", AttrValue::reference(id("a", "one"), "id")),
        ];
        assert!(matches!(
            Graph::new(nodes, BTreeMap::new()),
            Err(StratumError::Cycle(_))
        ));
    }

    #[test]
    fn test_duplicate_and_unknown_dependency() {
        let nodes = vec![
            ResourceNode::new(id("a", "one")),
            ResourceNode::new(id("a", "one")),
        ];
        assert!(matches!(
            Graph::new(nodes, BTreeMap::new()),
            Err(StratumError::Config(ConfigError::DuplicateName { .. }))
        ));

        let nodes = vec![ResourceNode::new(id("a", "one")).with_depends_on(id("b", "missing"))];
        assert!(matches!(
            Graph::new(nodes, BTreeMap::new()),
            Err(StratumError::Config(ConfigError::UnknownResource { .. }))
        ));
    }

    #[test]
    fn test_external_reference_has_no_edge() {
        let nodes = vec![
            ResourceNode::new(id("a", "one"))
                .with_attribute("x", AttrValue::reference(id("legacy", "net"), "id")),
        ];
        let graph = Graph::new(nodes, BTreeMap::new()).unwrap();
        assert!(graph.nodes()[0].dependencies().is_empty());
        assert_eq!(graph.nodes()[0].references().count(), 1);
    }
}
