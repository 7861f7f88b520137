use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::str::FromStr;

use cron::Schedule;

use tripwire_core::error::ValidationError;
use tripwire_core::types::FlowId;

use super::edge::Edge;
use super::flow::FlowGraph;
use super::node::{Node, OutcomeKind, TriggerSpec};

/// A flow that passed validation. Shared read-only between runs.
#[derive(Debug)]
pub struct ValidGraph {
    flow: FlowGraph,
    index: HashMap<String, usize>,
    /// Triggers in declaration order, then action/outcome nodes topologically.
    order: Vec<String>,
    /// Outgoing edge indices per node, in edge order.
    outgoing: HashMap<String, Vec<usize>>,
}

impl ValidGraph {
    pub fn flow(&self) -> &FlowGraph {
        &self.flow
    }

    pub fn id(&self) -> &FlowId {
        &self.flow.id
    }

    pub fn version(&self) -> u64 {
        self.flow.version
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|i| &self.flow.nodes[*i])
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Position of a node in the walk order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|n| n == id)
    }

    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(|i| &self.flow.edges[*i])
    }

    pub fn triggers(&self) -> impl Iterator<Item = (&Node, &TriggerSpec)> {
        self.flow
            .nodes
            .iter()
            .filter_map(|n| n.as_trigger().map(|t| (n, t)))
    }

    /// Every node reachable from `start` (excluding `start` itself unless on a path back).
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for edge in self.outgoing(id) {
                if seen.insert(edge.to.clone()) {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
        seen
    }
}

/// Validate a flow graph, reporting every violation found.
pub fn validate(flow: &FlowGraph) -> Result<ValidGraph, Vec<ValidationError>> {
    let mut errors = Vec::new();

    // Duplicate ids, each reported once.
    let mut index = HashMap::new();
    let mut reported = HashSet::new();
    for (i, node) in flow.nodes.iter().enumerate() {
        if index.contains_key(&node.id) {
            if reported.insert(node.id.clone()) {
                errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
            }
        } else {
            index.insert(node.id.clone(), i);
        }
    }

    // Dangling endpoints.
    for edge in &flow.edges {
        for end in [&edge.from, &edge.to] {
            if !index.contains_key(end) {
                errors.push(ValidationError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: end.clone(),
                });
            }
        }
    }

    if !flow.nodes.iter().any(Node::is_trigger) {
        errors.push(ValidationError::MissingTrigger);
    }
    if !flow.nodes.iter().any(Node::is_outcome) {
        errors.push(ValidationError::MissingOutcome);
    }

    let node_of = |id: &str| index.get(id).map(|i| &flow.nodes[*i]);
    let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, edge) in flow.edges.iter().enumerate() {
        if node_of(&edge.from).is_some() && node_of(&edge.to).is_some() {
            outgoing.entry(edge.from.clone()).or_default().push(i);
        }
    }

    let topo = match topological_order(flow, &index, &outgoing) {
        Ok(order) => Some(order),
        Err(nodes) => {
            errors.push(ValidationError::Cycle { nodes });
            None
        }
    };

    // Reachability from any trigger.
    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = flow
        .nodes
        .iter()
        .filter(|n| n.is_trigger())
        .map(|n| n.id.as_str())
        .collect();
    while let Some(id) = queue.pop_front() {
        for i in outgoing.get(id).into_iter().flatten() {
            let to = flow.edges[*i].to.as_str();
            if reached.insert(to) {
                queue.push_back(to);
            }
        }
    }
    let mut unreachable_seen = HashSet::new();
    for node in flow.nodes.iter().filter(|n| n.is_action()) {
        if !reached.contains(node.id.as_str()) && unreachable_seen.insert(node.id.as_str()) {
            errors.push(ValidationError::UnreachableAction(node.id.clone()));
        }
    }

    // Node payloads.
    for node in &flow.nodes {
        if let Some(trigger) = node.as_trigger() {
            match trigger {
                TriggerSpec::Schedule { cron } => {
                    if let Err(e) = Schedule::from_str(cron) {
                        errors.push(ValidationError::InvalidSchedule {
                            node: node.id.clone(),
                            expr: cron.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
                TriggerSpec::Event { source } if source.trim().is_empty() => {
                    errors.push(ValidationError::InvalidPayload {
                        node: node.id.clone(),
                        reason: "event source must not be empty".into(),
                    });
                }
                TriggerSpec::Condition { source, policy } => {
                    if source.trim().is_empty() {
                        errors.push(ValidationError::InvalidPayload {
                            node: node.id.clone(),
                            reason: "condition source must not be empty".into(),
                        });
                    }
                    for problem in policy.check() {
                        errors.push(ValidationError::InvalidPayload {
                            node: node.id.clone(),
                            reason: format!("policy: {}", problem),
                        });
                    }
                }
                _ => {}
            }
        }
        if let Some(action) = node.as_action() {
            if let Err(reason) = action.action.check() {
                errors.push(ValidationError::InvalidPayload {
                    node: node.id.clone(),
                    reason,
                });
            }
            if action.timeout_secs == Some(0) {
                errors.push(ValidationError::InvalidPayload {
                    node: node.id.clone(),
                    reason: "timeout_secs must be at least 1".into(),
                });
            }
        }
    }

    if let Some(gate) = &flow.gate {
        errors.extend(gate.check().into_iter().map(ValidationError::InvalidPolicy));
    }

    // Guards belong on conditional outcome edges only.
    for edge in &flow.edges {
        let Some(guard) = &edge.guard else { continue };
        let Some(from) = node_of(&edge.from) else { continue };
        if from.outcome_kind() != Some(OutcomeKind::Conditional) {
            errors.push(ValidationError::UnexpectedGuard {
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        }
        for referenced in guard.referenced_nodes() {
            if node_of(referenced).is_none() {
                errors.push(ValidationError::InvalidPayload {
                    node: edge.from.clone(),
                    reason: format!("guard references unknown node '{}'", referenced),
                });
            }
        }
    }

    for node in &flow.nodes {
        if node.outcome_kind() == Some(OutcomeKind::Conditional) && !outgoing.contains_key(&node.id) {
            errors.push(ValidationError::DeadEndConditional(node.id.clone()));
        }
    }

    match topo {
        Some(order) if errors.is_empty() => Ok(ValidGraph {
            flow: flow.clone(),
            index,
            order,
            outgoing,
        }),
        _ => Err(errors),
    }
}

/// Kahn's algorithm over the action/outcome subgraph. Triggers lead the order.
/// On a cycle, returns the sorted ids of the nodes left unsorted.
fn topological_order(
    flow: &FlowGraph,
    index: &HashMap<String, usize>,
    outgoing: &HashMap<String, Vec<usize>>,
) -> Result<Vec<String>, Vec<String>> {
    let is_body = |id: &str| {
        index
            .get(id)
            .is_some_and(|i| !flow.nodes[*i].is_trigger())
    };

    // Unique body nodes in declaration order.
    let mut body: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();
    for node in flow.nodes.iter().filter(|n| !n.is_trigger()) {
        if seen.insert(node.id.as_str()) {
            body.push(node.id.as_str());
        }
    }

    let mut in_degree: HashMap<&str, usize> = body.iter().map(|id| (*id, 0)).collect();
    for (from, edges) in outgoing {
        if !is_body(from) {
            continue;
        }
        for i in edges {
            let to = flow.edges[*i].to.as_str();
            if is_body(to) {
                *in_degree.entry(to).or_default() += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = body.iter().copied().filter(|id| in_degree[id] == 0).collect();
    let mut sorted: Vec<String> = Vec::with_capacity(body.len());
    while let Some(id) = queue.pop_front() {
        sorted.push(id.to_string());
        for i in outgoing.get(id).into_iter().flatten() {
            let to = flow.edges[*i].to.as_str();
            if let Some(d) = in_degree.get_mut(to) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(to);
                }
            }
        }
    }

    if sorted.len() < body.len() {
        let done: HashSet<&str> = sorted.iter().map(String::as_str).collect();
        let mut remaining: BTreeSet<&str> =
            body.iter().copied().filter(|id| !done.contains(id)).collect();
        // Drop nodes merely downstream of a cycle: peel off anything with no
        // outgoing edge back into the remaining set.
        loop {
            let sinks: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    !outgoing
                        .get(*id)
                        .into_iter()
                        .flatten()
                        .any(|i| remaining.contains(flow.edges[*i].to.as_str()))
                })
                .collect();
            if sinks.is_empty() {
                break;
            }
            for id in sinks {
                remaining.remove(id);
            }
        }
        return Err(remaining.into_iter().map(str::to_string).collect());
    }

    let mut order: Vec<String> = Vec::new();
    let mut seen_triggers = HashSet::new();
    for node in flow.nodes.iter().filter(|n| n.is_trigger()) {
        if seen_triggers.insert(node.id.as_str()) {
            order.push(node.id.clone());
        }
    }
    order.extend(sorted);
    Ok(order)
}
