//! Plan construction.
//!
//! The [`Planner`] walks the graph in topological order, resolves every
//! declared attribute against the decisions already made for its
//! dependencies, diffs the result against the node's state record and picks
//! an action. Records with no node are destroyed, dependents first.

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::error::{PlanError, Result, StratumError};
use crate::graph::{Graph, Reference, ResourceId, ResourceNode};
use crate::state::StateRecord;

use super::diff::{AttributeChange, DiffEngine, PlannedAttributes, PlannedValue};
use super::plan::{Action, Plan, PlanEntry};

/// What the planner decided for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Create,
    Replace,
    Update,
    NoOp,
}

#[derive(Debug)]
struct NodePlan {
    decision: Decision,
    reason: String,
    planned: PlannedAttributes,
    changes: Vec<AttributeChange>,
}

/// Builds plans from a graph and the current state records.
#[derive(Debug)]
pub struct Planner<'a> {
    graph: &'a Graph,
    records: BTreeMap<ResourceId, StateRecord>,
    config_hash: String,
    environment: String,
    diff: DiffEngine,
}

impl<'a> Planner<'a> {
    /// Creates a planner over a graph and every known state record.
    #[must_use]
    pub fn new(graph: &'a Graph, records: impl IntoIterator<Item = StateRecord>) -> Self {
        Self {
            graph,
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            config_hash: String::new(),
            environment: String::from("dev"),
            diff: DiffEngine::new(),
        }
    }

    /// Sets the configuration hash recorded in the plan.
    #[must_use]
    pub fn config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    /// Sets the environment recorded in the plan.
    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Computes the plan.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::UnresolvedReference` when a reference targets a
    /// resource absent from both the graph and state, or a recorded
    /// resource lacks the referenced attribute.
    pub fn plan(&self) -> Result<Plan> {
        let order = self.graph.topological_order();
        let mut decided: HashMap<ResourceId, NodePlan> = HashMap::with_capacity(order.len());

        for node in &order {
            let node_plan = self.plan_node(node, &decided)?;
            debug!(
                "Planned {} as {:?}: {}",
                node.id, node_plan.decision, node_plan.reason
            );
            decided.insert(node.id.clone(), node_plan);
        }

        let external = self.external_references();
        let mut destroy_ids: BTreeSet<ResourceId> = self
            .records
            .keys()
            .filter(|id| !self.graph.contains(id) && !external.contains(*id))
            .cloned()
            .collect();
        for (id, node_plan) in &decided {
            if node_plan.decision == Decision::Replace {
                destroy_ids.insert(id.clone());
            }
        }

        let mut entries = self.destroy_entries(&destroy_ids, |id| {
            decided
                .get(id)
                .map_or_else(|| String::from("no longer declared"), |p| p.reason.clone())
        });
        let destroy_index: HashMap<ResourceId, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();

        let mut node_index: HashMap<ResourceId, usize> = HashMap::with_capacity(order.len());
        for node in &order {
            let Some(node_plan) = decided.remove(&node.id) else {
                continue;
            };
            let record = self.records.get(&node.id);

            let mut wait_for: Vec<usize> = node
                .dependencies()
                .iter()
                .filter_map(|dep| node_index.get(dep).copied())
                .collect();
            if let Some(&destroy) = destroy_index.get(&node.id) {
                wait_for.push(destroy);
            }
            wait_for.sort_unstable();

            let (action, replacement, prior) = match node_plan.decision {
                Decision::Create => (Action::Create, false, None),
                Decision::Replace => (Action::Create, true, None),
                Decision::Update => (Action::Update, false, record.map(|r| r.attributes.clone())),
                Decision::NoOp => (Action::NoOp, false, record.map(|r| r.attributes.clone())),
            };

            node_index.insert(node.id.clone(), entries.len());
            entries.push(PlanEntry {
                id: node.id.clone(),
                resource_type: node.resource_type().to_string(),
                action,
                replacement,
                reason: node_plan.reason,
                prior,
                prior_serial: record.map(|r| r.serial),
                planned: node_plan.planned,
                changes: node_plan.changes,
                config: node.attributes.clone(),
                dependencies: node.dependencies().iter().cloned().collect(),
                wait_for,
            });
        }

        let plan = Plan {
            created_at: Utc::now(),
            config_hash: self.config_hash.clone(),
            environment: self.environment.clone(),
            destroy: false,
            entries: self.release_orphans(entries),
        };
        info!("Plan: {}", plan.summary());
        Ok(plan)
    }

    fn plan_node(
        &self,
        node: &ResourceNode,
        decided: &HashMap<ResourceId, NodePlan>,
    ) -> Result<NodePlan> {
        let mut planned = PlannedAttributes::new();
        for (name, value) in &node.attributes {
            let resolved = value.resolve(&mut |r: &Reference| self.lookup(&node.id, r, decided))?;
            planned.insert(name.clone(), PlannedValue::from(resolved));
        }

        let Some(record) = self.records.get(&node.id) else {
            return Ok(NodePlan {
                decision: Decision::Create,
                reason: String::from("new resource"),
                changes: self.diff.creation_diff(&planned),
                planned,
            });
        };

        let changes = self
            .diff
            .compute_diff(&record.desired, &planned, &node.replace_on_change);

        if record.is_pending() {
            return Ok(NodePlan {
                decision: Decision::Replace,
                reason: String::from("interrupted create"),
                planned,
                changes,
            });
        }

        if changes.is_empty() {
            return Ok(NodePlan {
                decision: Decision::NoOp,
                reason: String::new(),
                planned,
                changes,
            });
        }

        let forcing: Vec<&str> = changes
            .iter()
            .filter(|c| c.forces_replacement)
            .map(|c| c.attribute.as_str())
            .collect();

        let (decision, reason) = if forcing.is_empty() {
            let changed: Vec<&str> = changes.iter().map(|c| c.attribute.as_str()).collect();
            (Decision::Update, format!("changed: {}", changed.join(", ")))
        } else {
            (
                Decision::Replace,
                format!("{} forces replacement", forcing.join(", ")),
            )
        };

        Ok(NodePlan {
            decision,
            reason,
            planned,
            changes,
        })
    }

    /// Resolves one reference during planning.
    ///
    /// `Ok(None)` means the value is only known after apply.
    fn lookup(
        &self,
        from: &ResourceId,
        reference: &Reference,
        decided: &HashMap<ResourceId, NodePlan>,
    ) -> Result<Option<Value>> {
        let target = &reference.target;
        let attribute = reference.attribute.as_str();
        let record = self.records.get(target);
        let recorded = || record.and_then(|r| r.value(attribute)).cloned();

        if let Some(target_plan) = decided.get(target) {
            let declared = target_plan.planned.get(attribute).map(|v| v.known().cloned());
            return match target_plan.decision {
                Decision::NoOp => recorded()
                    .map(Some)
                    .ok_or_else(|| unresolved(from, reference, "no recorded value")),
                Decision::Update => Ok(declared.unwrap_or_else(recorded)),
                Decision::Create | Decision::Replace => Ok(declared.flatten()),
            };
        }

        if self.graph.contains(target) {
            return Err(StratumError::internal(format!(
                "{target} was not planned before its dependent {from}"
            )));
        }

        match record {
            Some(_) => recorded()
                .map(Some)
                .ok_or_else(|| unresolved(from, reference, "no recorded value")),
            None => Err(unresolved(
                from,
                reference,
                "resource is neither declared nor recorded",
            )),
        }
    }

    /// Destroy entries for `ids`, dependents first.
    fn destroy_entries(
        &self,
        ids: &BTreeSet<ResourceId>,
        reason: impl Fn(&ResourceId) -> String,
    ) -> Vec<PlanEntry> {
        let mut placed = HashMap::with_capacity(ids.len());
        let mut entries = Vec::with_capacity(ids.len());

        for id in self.destroy_order(ids) {
            let Some(record) = self.records.get(&id) else {
                continue;
            };
            let wait_for = self.destroy_waits(&id, ids, &placed);
            placed.insert(id.clone(), entries.len());
            entries.push(PlanEntry {
                resource_type: record.resource_type.clone(),
                action: Action::Destroy,
                replacement: self.graph.contains(&id),
                reason: reason(&id),
                prior: Some(record.attributes.clone()),
                prior_serial: Some(record.serial),
                planned: PlannedAttributes::new(),
                changes: Vec::new(),
                config: BTreeMap::new(),
                dependencies: record.dependencies.clone(),
                wait_for,
                id,
            });
        }

        entries
    }

    /// Undeclared resources that declared nodes still reference.
    fn external_references(&self) -> BTreeSet<ResourceId> {
        self.graph
            .nodes()
            .iter()
            .flat_map(ResourceNode::references)
            .filter(|r| !self.graph.contains(&r.target))
            .map(|r| r.target.clone())
            .collect()
    }

    /// Orders destroys so that dependents go before their dependencies.
    fn destroy_order(&self, ids: &BTreeSet<ResourceId>) -> Vec<ResourceId> {
        let key = |id: &ResourceId| {
            let declaration = self
                .graph
                .get(id)
                .map_or(usize::MAX, ResourceNode::declaration);
            (declaration, id.clone())
        };

        let mut blockers: HashMap<&ResourceId, usize> = ids.iter().map(|id| (id, 0)).collect();
        for id in ids {
            for dep in self.recorded_dependencies(id, ids) {
                if let Some(count) = blockers.get_mut(dep) {
                    *count += 1;
                }
            }
        }

        let mut ready: BTreeSet<(usize, ResourceId)> = blockers
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| key(*id))
            .collect();
        let mut order = Vec::with_capacity(ids.len());

        while let Some((_, id)) = ready.pop_first() {
            for dep in self.recorded_dependencies(&id, ids) {
                if let Some(count) = blockers.get_mut(dep) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(key(dep));
                    }
                }
            }
            order.push(id);
        }

        if order.len() < ids.len() {
            warn!("Recorded dependencies of destroyed resources form a cycle; ordering by declaration");
            let mut rest: Vec<(usize, ResourceId)> = ids
                .iter()
                .filter(|id| !order.contains(id))
                .map(key)
                .collect();
            rest.sort();
            order.extend(rest.into_iter().map(|(_, id)| id));
        }

        order
    }

    /// Recorded dependencies of `id` that are also being destroyed.
    fn recorded_dependencies<'s>(
        &'s self,
        id: &ResourceId,
        ids: &'s BTreeSet<ResourceId>,
    ) -> impl Iterator<Item = &'s ResourceId> {
        self.records
            .get(id)
            .map(|r| r.dependencies.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(move |dep| ids.contains(*dep))
    }

    /// A destroy waits for the destroys of every resource that depended on it.
    fn destroy_waits(
        &self,
        id: &ResourceId,
        ids: &BTreeSet<ResourceId>,
        placed: &HashMap<ResourceId, usize>,
    ) -> Vec<usize> {
        let mut waits: Vec<usize> = ids
            .iter()
            .filter(|other| self.recorded_dependencies(other, ids).any(|dep| dep == id))
            .filter_map(|other| placed.get(other).copied())
            .collect();
        waits.sort_unstable();
        waits
    }

    /// Makes the destroy of an undeclared resource wait until every declared
    /// resource recorded as depending on it has been moved off it.
    ///
    /// Entries keep their position where they can; only what must move to
    /// keep every `wait_for` pointing backwards does. If the extra waits
    /// cannot be satisfied the original order is kept.
    fn release_orphans(&self, mut entries: Vec<PlanEntry>) -> Vec<PlanEntry> {
        let holders: Vec<(usize, usize)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.action == Action::Destroy && !self.graph.contains(&e.id))
            .flat_map(|(destroy, orphan)| {
                entries
                    .iter()
                    .enumerate()
                    .filter(move |(_, e)| {
                        matches!(e.action, Action::Update | Action::NoOp)
                            && self
                                .records
                                .get(&e.id)
                                .is_some_and(|r| r.dependencies.contains(&orphan.id))
                    })
                    .map(move |(holder, _)| (destroy, holder))
            })
            .collect();
        if holders.is_empty() {
            return entries;
        }

        for &(destroy, holder) in &holders {
            debug!(
                "{} is destroyed after {} moves off it",
                entries[destroy].id, entries[holder].id
            );
            entries[destroy].wait_for.push(holder);
        }

        if let Some(order) = stable_order(&entries) {
            return reindex(entries, &order);
        }

        warn!("Undeclared resources cannot be destroyed after their dependents; keeping plan order");
        for &(destroy, _) in &holders {
            entries[destroy].wait_for.retain(|w| *w < destroy);
        }
        entries
    }
}

/// Topological order of plan entries that prefers the current position.
fn stable_order(entries: &[PlanEntry]) -> Option<Vec<usize>> {
    let mut blockers: Vec<usize> = entries.iter().map(|e| e.wait_for.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, entry) in entries.iter().enumerate() {
        for &w in &entry.wait_for {
            dependents.get_mut(w)?.push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..entries.len()).filter(|i| blockers[*i] == 0).collect();
    let mut order = Vec::with_capacity(entries.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            blockers[d] -= 1;
            if blockers[d] == 0 {
                ready.insert(d);
            }
        }
    }
    (order.len() == entries.len()).then_some(order)
}

/// Moves entries into `order`, rewriting `wait_for` to the new positions.
fn reindex(entries: Vec<PlanEntry>, order: &[usize]) -> Vec<PlanEntry> {
    let mut position = vec![0; entries.len()];
    for (new, &old) in order.iter().enumerate() {
        position[old] = new;
    }

    let mut slots: Vec<Option<PlanEntry>> = entries.into_iter().map(Some).collect();
    order
        .iter()
        .filter_map(|&old| slots[old].take())
        .map(|mut entry| {
            for w in &mut entry.wait_for {
                *w = position[*w];
            }
            entry.wait_for.sort_unstable();
            entry
        })
        .collect()
}

/// Builds a plan that destroys every recorded resource.
#[must_use]
pub fn destroy_plan(
    records: impl IntoIterator<Item = StateRecord>,
    config_hash: impl Into<String>,
    environment: impl Into<String>,
) -> Plan {
    let graph = Graph::empty();
    let planner = Planner::new(&graph, records);
    let ids: BTreeSet<ResourceId> = planner.records.keys().cloned().collect();
    let entries = planner.destroy_entries(&ids, |_| String::from("destroy requested"));
    info!("Destroy plan: {} resource(s)", entries.len());

    Plan {
        created_at: Utc::now(),
        config_hash: config_hash.into(),
        environment: environment.into(),
        destroy: true,
        entries,
    }
}

fn unresolved(from: &ResourceId, reference: &Reference, reason: &str) -> StratumError {
    PlanError::UnresolvedReference {
        resource: from.to_string(),
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttrValue, AttributeMap};
    use serde_json::json;

    fn net() -> ResourceId {
        ResourceId::root("network", "main")
    }

    fn subnet() -> ResourceId {
        ResourceId::root("subnet", "a")
    }

    fn service() -> ResourceId {
        ResourceId::root("service", "api")
    }

    /// Network <- Subnet <- Service, declared in reverse order.
    fn graph(cidr: &str) -> Graph {
        Graph::new(
            vec![
                ResourceNode::new(service())
                    .with_attribute("subnet_id", AttrValue::reference(subnet(), "id"))
                    .with_attribute("image", AttrValue::string("api:1")),
                ResourceNode::new(subnet())
                    .with_attribute("network_id", AttrValue::reference(net(), "id"))
                    .with_attribute("cidr", AttrValue::string("10.0.1.0/24")),
                ResourceNode::new(net())
                    .with_attribute("cidr", AttrValue::string(cidr))
                    .with_replace_on_change("cidr"),
            ],
            BTreeMap::new(),
        )
        .unwrap()
    }

    fn attrs(pairs: &[(&str, Value)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    /// Records as a successful apply of `graph("10.0.0.0/16")` would leave them.
    fn applied_records() -> Vec<StateRecord> {
        vec![
            StateRecord::confirmed(
                net(),
                attrs(&[("cidr", json!("10.0.0.0/16"))]),
                attrs(&[("id", json!("net-1")), ("cidr", json!("10.0.0.0/16"))]),
                vec![],
            ),
            StateRecord::confirmed(
                subnet(),
                attrs(&[
                    ("cidr", json!("10.0.1.0/24")),
                    ("network_id", json!("net-1")),
                ]),
                attrs(&[("id", json!("subnet-1"))]),
                vec![net()],
            ),
            StateRecord::confirmed(
                service(),
                attrs(&[("image", json!("api:1")), ("subnet_id", json!("subnet-1"))]),
                attrs(&[("id", json!("service-1"))]),
                vec![subnet()],
            ),
        ]
    }

    fn position(plan: &Plan, id: &ResourceId, action: Action) -> usize {
        plan.entry(id, action).map(|(i, _)| i).unwrap()
    }

    #[test]
    fn test_empty_state_creates_in_dependency_order() {
        let graph = graph("10.0.0.0/16");
        let plan = Planner::new(&graph, Vec::new()).plan().unwrap();

        let ids: Vec<_> = plan.entries.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![net(), subnet(), service()]);
        assert!(plan.entries.iter().all(|e| e.action == Action::Create));

        let subnet_entry = &plan.entries[1];
        assert_eq!(subnet_entry.wait_for, vec![0]);
        assert_eq!(
            subnet_entry.planned.get("network_id"),
            Some(&PlannedValue::Unknown)
        );
        assert_eq!(
            subnet_entry.planned.get("cidr"),
            Some(&PlannedValue::Known(json!("10.0.1.0/24")))
        );
    }

    #[test]
    fn test_applied_state_is_idempotent() {
        let graph = graph("10.0.0.0/16");
        let plan = Planner::new(&graph, applied_records()).plan().unwrap();

        assert!(!plan.has_changes());
        assert_eq!(plan.summary().unchanged, 3);
    }

    #[test]
    fn test_replacement_destroys_before_create() {
        let graph = graph("10.9.0.0/16");
        let plan = Planner::new(&graph, applied_records()).plan().unwrap();

        let destroy = position(&plan, &net(), Action::Destroy);
        let create = position(&plan, &net(), Action::Create);
        assert!(destroy < create);
        assert!(plan.entries[destroy].replacement);
        assert!(plan.entries[create].replacement);
        assert!(plan.entries[create].wait_for.contains(&destroy));
        assert_eq!(plan.entries[create].reason, "cidr forces replacement");

        // The subnet sees an unknown network id and is updated after the new network.
        let (i, subnet_entry) = plan.entry(&subnet(), Action::Update).unwrap();
        assert!(i > create);
        assert!(subnet_entry.wait_for.contains(&create));

        // The service's subnet id is unchanged, so it stays put.
        assert!(plan.entry(&service(), Action::NoOp).is_some());
    }

    #[test]
    fn test_orphans_destroyed_dependents_first() {
        let graph = Graph::empty();
        let plan = Planner::new(&graph, applied_records()).plan().unwrap();

        let ids: Vec<_> = plan.entries.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![service(), subnet(), net()]);
        assert!(plan.entries.iter().all(|e| e.action == Action::Destroy && !e.replacement));
        assert_eq!(plan.entries[1].wait_for, vec![0]);
        assert_eq!(plan.entries[2].wait_for, vec![1]);
    }

    #[test]
    fn test_destroy_plan_covers_every_record() {
        let plan = destroy_plan(applied_records(), "hash", "dev");
        assert!(plan.destroy);
        assert_eq!(plan.summary().destroy, 3);
        assert_eq!(plan.entries[0].id, service());
    }

    #[test]
    fn test_update_in_place() {
        let nodes = vec![
            ResourceNode::new(net()).with_attribute("cidr", AttrValue::string("10.0.0.0/16")),
            ResourceNode::new(subnet())
                .with_attribute("network_id", AttrValue::reference(net(), "id"))
                .with_attribute("cidr", AttrValue::string("10.0.2.0/24")),
        ];
        let graph = Graph::new(nodes, BTreeMap::new()).unwrap();
        let records: Vec<_> = applied_records().into_iter().take(2).collect();

        let plan = Planner::new(&graph, records).plan().unwrap();
        let (_, entry) = plan.entry(&subnet(), Action::Update).unwrap();
        assert_eq!(entry.changes.len(), 1);
        assert_eq!(entry.changes[0].attribute, "cidr");
        // Resolved from the network's recorded id.
        assert_eq!(
            entry.planned.get("network_id"),
            Some(&PlannedValue::Known(json!("net-1")))
        );
        assert_eq!(entry.prior_serial, Some(2));
    }

    #[test]
    fn test_pending_record_is_replaced() {
        let graph = Graph::new(
            vec![ResourceNode::new(net()).with_attribute("cidr", AttrValue::string("10.0.0.0/16"))],
            BTreeMap::new(),
        )
        .unwrap();
        let pending = StateRecord::pending(net(), attrs(&[("cidr", json!("10.0.0.0/16"))]), vec![]);

        let plan = Planner::new(&graph, vec![pending]).plan().unwrap();
        assert_eq!(plan.summary().replace, 1);
        assert_eq!(plan.entries[0].action, Action::Destroy);
        assert_eq!(plan.entries[1].reason, "interrupted create");
    }

    #[test]
    fn test_reference_to_unknown_resource_fails() {
        let ghost = ResourceId::root("network", "ghost");
        let graph = Graph::new(
            vec![ResourceNode::new(subnet()).with_attribute("network_id", AttrValue::reference(ghost, "id"))],
            BTreeMap::new(),
        )
        .unwrap();

        let err = Planner::new(&graph, Vec::new()).plan().unwrap_err();
        assert!(matches!(
            err,
            StratumError::Plan(PlanError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_reference_to_recorded_resource_outside_graph() {
        let graph = Graph::new(
            vec![ResourceNode::new(subnet()).with_attribute("network_id", AttrValue::reference(net(), "id"))],
            BTreeMap::new(),
        )
        .unwrap();
        let records: Vec<_> = applied_records().into_iter().take(1).collect();

        let plan = Planner::new(&graph, records).plan().unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.entries[0].planned.get("network_id"),
            Some(&PlannedValue::Known(json!("net-1")))
        );
    }

    #[test]
    fn test_noop_target_without_recorded_attribute_fails() {
        let graph = Graph::new(
            vec![
                ResourceNode::new(net())
                    .with_attribute("cidr", AttrValue::string("10.0.0.0/16"))
                    .with_computed("arn"),
                ResourceNode::new(subnet())
                    .with_attribute("network_arn", AttrValue::reference(net(), "arn")),
            ],
            BTreeMap::new(),
        )
        .unwrap();
        let records: Vec<_> = applied_records().into_iter().take(1).collect();

        let err = Planner::new(&graph, records).plan().unwrap_err();
        assert!(err.to_string().contains("no recorded value"));
    }

    #[test]
    fn test_orphan_destroyed_after_dependent_moves_off() {
        let old = ResourceId::root("network", "old");
        let graph = Graph::new(
            vec![ResourceNode::new(subnet()).with_attribute("network_id", AttrValue::string("net-2"))],
            BTreeMap::new(),
        )
        .unwrap();
        let records = vec![
            StateRecord::confirmed(
                old.clone(),
                AttributeMap::new(),
                attrs(&[("id", json!("net-1"))]),
                vec![],
            ),
            StateRecord::confirmed(
                subnet(),
                attrs(&[("network_id", json!("net-1"))]),
                attrs(&[("id", json!("subnet-1"))]),
                vec![old.clone()],
            ),
        ];

        let plan = Planner::new(&graph, records).plan().unwrap();
        let update = position(&plan, &subnet(), Action::Update);
        let destroy = position(&plan, &old, Action::Destroy);
        assert!(update < destroy);
        assert_eq!(plan.entries[destroy].wait_for, vec![update]);
        assert!(plan.entries[update].wait_for.is_empty());

        // The reordered plan still passes the saved-plan checks.
        Plan::from_json(&plan.to_json().unwrap()).unwrap();
    }

    /// Deterministic generator for the randomized graph tests.
    struct XorShift(u64);

    impl XorShift {
        fn below(&mut self, bound: usize) -> usize {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            usize::try_from(self.0 % bound as u64).unwrap()
        }
    }

    fn node_id(rank: usize) -> ResourceId {
        ResourceId::root("node", format!("n{rank}"))
    }

    fn orphan_id(k: usize) -> ResourceId {
        ResourceId::root("orphan", format!("o{k}"))
    }

    /// A random DAG where rank `r` may depend on any lower rank, declared in
    /// shuffled order, plus records that mix creates, no-ops, updates,
    /// interrupted creates and undeclared resources.
    fn random_case(rng: &mut XorShift) -> (Graph, Vec<StateRecord>) {
        let n = 1 + rng.below(12);
        let mut ranks: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            ranks.swap(i, rng.below(i + 1));
        }

        let orphans = rng.below(4);
        let mut records = Vec::new();
        for k in 0..orphans {
            let deps = (0..k).filter(|_| rng.below(2) == 0).map(orphan_id).collect();
            records.push(StateRecord::confirmed(
                orphan_id(k),
                AttributeMap::new(),
                attrs(&[("id", json!(format!("o-{k}")))]),
                deps,
            ));
        }

        let mut nodes = Vec::with_capacity(n);
        for &rank in &ranks {
            let size = json!(rng.below(3));
            let mut node = ResourceNode::new(node_id(rank)).with_attribute("size", AttrValue::Literal(size.clone()));
            let mut deps: Vec<ResourceId> = Vec::new();
            for lower in 0..rank {
                if rng.below(3) == 0 {
                    node = node.with_depends_on(node_id(lower));
                    deps.push(node_id(lower));
                }
            }
            deps.extend((0..orphans).filter(|_| rng.below(3) == 0).map(orphan_id));

            let recorded_size = match rng.below(4) {
                0 => None,
                1 => Some(size),
                _ => Some(json!(9)),
            };
            if let Some(recorded) = recorded_size {
                let desired = attrs(&[("size", recorded)]);
                records.push(if rng.below(5) == 0 {
                    StateRecord::pending(node_id(rank), desired, deps)
                } else {
                    let id = json!(format!("n-{rank}"));
                    StateRecord::confirmed(node_id(rank), desired, attrs(&[("id", id)]), deps)
                });
            }
            nodes.push(node);
        }

        (Graph::new(nodes, BTreeMap::new()).unwrap(), records)
    }

    #[test]
    fn test_random_graphs_order_and_wait_for() {
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);

        for _ in 0..200 {
            let (graph, records) = random_case(&mut rng);

            // Every step takes the earliest-declared node whose dependencies are placed.
            let order = graph.topological_order();
            assert_eq!(order.len(), graph.len());
            let mut placed = BTreeSet::new();
            for node in &order {
                let earliest_ready = graph
                    .nodes()
                    .iter()
                    .filter(|n| !placed.contains(&n.id))
                    .filter(|n| n.dependencies().iter().all(|d| placed.contains(d)))
                    .map(ResourceNode::declaration)
                    .min();
                assert_eq!(earliest_ready, Some(node.declaration()));
                placed.insert(node.id.clone());
            }

            let by_id: BTreeMap<ResourceId, StateRecord> =
                records.iter().map(|r| (r.id.clone(), r.clone())).collect();
            let plan = Planner::new(&graph, records).plan().unwrap();

            for (i, entry) in plan.entries.iter().enumerate() {
                assert!(entry.wait_for.iter().all(|&w| w < i), "{} waits forward", entry.id);

                if entry.action != Action::Destroy {
                    for dep in graph.get(&entry.id).unwrap().dependencies() {
                        let (d, _) = plan
                            .entries
                            .iter()
                            .enumerate()
                            .find(|(_, e)| &e.id == dep && e.action != Action::Destroy)
                            .unwrap();
                        assert!(entry.wait_for.contains(&d));
                    }
                    continue;
                }

                // Anything still recorded as depending on this resource goes first.
                for (j, other) in plan.entries.iter().enumerate() {
                    let holds = by_id
                        .get(&other.id)
                        .is_some_and(|r| r.dependencies.contains(&entry.id));
                    let moves_off = other.action != Action::Create
                        && (other.action == Action::Destroy || !entry.replacement);
                    if holds && moves_off {
                        assert!(entry.wait_for.contains(&j), "{} before {}", entry.id, other.id);
                    }
                }
            }
        }
    }
}
