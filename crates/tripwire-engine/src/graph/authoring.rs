//! Authoring model: the loosely typed node/edge shape produced by flow
//! editors, with presentation metadata. Converted into `FlowGraph` with
//! `TryFrom`; position and style are dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tripwire_core::error::ValidationError;
use tripwire_core::policy::GatePolicy;
use tripwire_core::types::{FlowId, FlowStatus};

use super::edge::{Edge, Guard};
use super::flow::FlowGraph;
use super::node::{ActionNode, Node, NodeKind, OutcomeKind, TriggerSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoringFlow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub status: FlowStatus,
    #[serde(default)]
    pub nodes: Vec<AuthoringNode>,
    #[serde(default)]
    pub edges: Vec<AuthoringEdge>,
    #[serde(default)]
    pub gate: Option<GatePolicy>,
}

fn default_version() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoringNode {
    pub id: String,
    /// `trigger`, `action` or `outcome`.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Free-form payload. `subtype` selects the variant; `label` is kept.
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoringEdge {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    /// May carry a `guard` object.
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,
}

impl TryFrom<AuthoringFlow> for FlowGraph {
    type Error = Vec<ValidationError>;

    fn try_from(flow: AuthoringFlow) -> Result<Self, Self::Error> {
        let mut errors = Vec::new();
        let mut nodes = Vec::with_capacity(flow.nodes.len());
        for raw in flow.nodes {
            match convert_node(raw) {
                Ok(node) => nodes.push(node),
                Err(e) => errors.push(e),
            }
        }

        let mut edges = Vec::with_capacity(flow.edges.len());
        for raw in flow.edges {
            let guard = match raw.data.as_ref().and_then(|d| d.get("guard")) {
                None | Some(Value::Null) => None,
                Some(g) => match serde_json::from_value::<Guard>(g.clone()) {
                    Ok(guard) => Some(guard),
                    Err(e) => {
                        errors.push(ValidationError::InvalidPayload {
                            node: raw.source.clone(),
                            reason: format!("edge to '{}' has an invalid guard: {}", raw.target, e),
                        });
                        continue;
                    }
                },
            };
            edges.push(Edge {
                from: raw.source,
                to: raw.target,
                guard,
            });
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(FlowGraph {
            id: FlowId(flow.id),
            name: flow.name,
            description: flow.description,
            version: flow.version,
            status: flow.status,
            nodes,
            edges,
            gate: flow.gate,
        })
    }
}

fn convert_node(raw: AuthoringNode) -> Result<Node, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidPayload {
        node: raw.id.clone(),
        reason,
    };

    let mut data = raw.data.clone();
    let label = match data.remove("label") {
        Some(Value::String(s)) => s,
        _ => String::new(),
    };
    let subtype = match data.remove("subtype") {
        Some(Value::String(s)) => s.to_lowercase(),
        _ => return Err(invalid("missing 'subtype'".into())),
    };

    let kind = match raw.node_type.to_lowercase().as_str() {
        "trigger" => {
            data.insert("type".into(), Value::String(subtype.replace('-', "_")));
            let trigger: TriggerSpec = serde_json::from_value(Value::Object(data))
                .map_err(|e| invalid(format!("trigger: {}", e)))?;
            NodeKind::Trigger { trigger }
        }
        "action" => {
            data.insert("action".into(), Value::String(subtype.replace('_', "-")));
            let action: ActionNode = serde_json::from_value(Value::Object(data))
                .map_err(|e| invalid(format!("action: {}", e)))?;
            NodeKind::Action(action)
        }
        "outcome" => {
            let outcome: OutcomeKind = serde_json::from_value(Value::String(subtype))
                .map_err(|e| invalid(format!("outcome: {}", e)))?;
            NodeKind::Outcome { outcome }
        }
        other => return Err(invalid(format!("unknown node type '{}'", other))),
    };

    Ok(Node {
        id: raw.id,
        label,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripwire_core::action::ActionSpec;
    use tripwire_core::types::NodeStatus;

    fn editor_flow() -> AuthoringFlow {
        serde_json::from_value(serde_json::json!({
            "id": "eu-latency",
            "name": "EU latency failover",
            "nodes": [
                {
                    "id": "t1",
                    "type": "trigger",
                    "position": { "x": 10, "y": 20 },
                    "data": {
                        "label": "Latency > 100ms",
                        "subtype": "condition",
                        "source": "edge-eu",
                        "policy": { "latency_ms": 100 }
                    }
                },
                {
                    "id": "a1",
                    "type": "action",
                    "style": { "background": "#fff" },
                    "data": {
                        "subtype": "switch_region",
                        "from": "eu-west-1",
                        "to": "eu-central-1",
                        "timeout_secs": 60
                    }
                },
                { "id": "o1", "type": "outcome", "data": { "subtype": "conditional" } },
                { "id": "ok", "type": "outcome", "data": { "subtype": "success" } }
            ],
            "edges": [
                { "id": "e1", "source": "t1", "target": "a1" },
                { "id": "e2", "source": "a1", "target": "o1" },
                {
                    "id": "e3", "source": "o1", "target": "ok",
                    "data": { "guard": { "type": "status", "node": "a1", "is": "succeeded" } }
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn converts_editor_graph() {
        let flow = FlowGraph::try_from(editor_flow()).unwrap();
        assert_eq!(flow.id.as_str(), "eu-latency");
        assert_eq!(flow.nodes.len(), 4);
        assert_eq!(flow.nodes[0].label, "Latency > 100ms");

        let action = flow.node("a1").unwrap().as_action().unwrap();
        assert_eq!(
            action.action,
            ActionSpec::SwitchRegion {
                from: "eu-west-1".into(),
                to: "eu-central-1".into()
            }
        );
        assert_eq!(action.timeout_secs, Some(60));
        assert_eq!(
            flow.edges[2].guard,
            Some(Guard::status("a1", NodeStatus::Succeeded))
        );
        assert!(crate::graph::validate(&flow).is_ok());
    }

    #[test]
    fn reports_every_malformed_node() {
        let mut raw = editor_flow();
        raw.nodes[1].data.remove("to");
        raw.nodes[2].node_type = "decision".into();
        raw.nodes[3].data.remove("subtype");
        let errors = FlowGraph::try_from(raw).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors
            .iter()
            .all(|e| matches!(e, ValidationError::InvalidPayload { .. })));
    }

    #[test]
    fn invalid_guard_is_reported() {
        let mut raw = editor_flow();
        raw.edges[2].data = Some(
            serde_json::json!({ "guard": { "type": "sometimes" } })
                .as_object()
                .cloned()
                .unwrap(),
        );
        let errors = FlowGraph::try_from(raw).unwrap_err();
        assert!(matches!(&errors[0], ValidationError::InvalidPayload { node, .. } if node == "o1"));
    }
}
