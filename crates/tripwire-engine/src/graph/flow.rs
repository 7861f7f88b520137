use serde::{Deserialize, Serialize};

use tripwire_core::policy::GatePolicy;
use tripwire_core::types::{FlowId, FlowStatus};

use super::edge::Edge;
use super::node::Node;

/// A named automation flow: triggers, actions and outcomes joined by edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub id: FlowId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Incremented on every structural edit.
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub status: FlowStatus,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Per-flow gate policy; the engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GatePolicy>,
}

fn default_version() -> u64 {
    1
}

impl FlowGraph {
    pub fn new(id: &str, name: impl Into<String>) -> Self {
        Self {
            id: FlowId::from_string(id),
            name: name.into(),
            description: String::new(),
            version: 1,
            status: FlowStatus::Draft,
            nodes: vec![],
            edges: vec![],
            gate: None,
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_gate(mut self, gate: GatePolicy) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_status(mut self, status: FlowStatus) -> Self {
        self.status = status;
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Start an edit: the next version, back in draft.
    pub fn revise(&self) -> Self {
        Self {
            version: self.version + 1,
            status: FlowStatus::Draft,
            ..self.clone()
        }
    }

    /// Same nodes, edges and gate policy. Name, description and status are
    /// not structural.
    pub fn same_structure(&self, other: &FlowGraph) -> bool {
        self.nodes == other.nodes && self.edges == other.edges && self.gate == other.gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::OutcomeKind;

    #[test]
    fn revise_bumps_version_and_resets_status() {
        let flow = FlowGraph::new("f", "Flow")
            .with_status(FlowStatus::Active)
            .with_node(Node::outcome("done", OutcomeKind::Success));
        let next = flow.revise();
        assert_eq!(next.version, 2);
        assert_eq!(next.status, FlowStatus::Draft);
        assert!(next.same_structure(&flow));
    }

    #[test]
    fn structure_ignores_presentation_fields() {
        let a = FlowGraph::new("f", "One").with_node(Node::outcome("done", OutcomeKind::Success));
        let mut b = a.clone();
        b.name = "Two".into();
        b.status = FlowStatus::Inactive;
        assert!(a.same_structure(&b));
        b.edges.push(Edge::new("done", "done"));
        assert!(!a.same_structure(&b));
    }

    #[test]
    fn defaults_when_deserializing() {
        let flow: FlowGraph = serde_json::from_value(serde_json::json!({
            "id": "f",
            "name": "F",
            "nodes": []
        }))
        .unwrap();
        assert_eq!(flow.version, 1);
        assert_eq!(flow.status, FlowStatus::Draft);
        assert!(flow.edges.is_empty());
    }
}
