use serde::{Deserialize, Serialize};

use tripwire_core::action::{ActionKind, ActionSpec};
use tripwire_core::policy::TrafficSelector;

use crate::condition::ThresholdPolicy;

/// A node in a flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the flow.
    pub id: String,
    /// Human-readable label.
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Tagged node variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger { trigger: TriggerSpec },
    Action(ActionNode),
    Outcome { outcome: OutcomeKind },
}

/// What makes a trigger fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Cron recurrence (seconds resolution).
    Schedule { cron: String },
    /// Named event source.
    Event { source: String },
    /// Threshold policy over a metric source.
    Condition { source: String, policy: ThresholdPolicy },
    Manual,
}

impl TriggerSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Schedule { .. } => "schedule",
            Self::Event { .. } => "event",
            Self::Condition { .. } => "condition",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    #[serde(flatten)]
    pub action: ActionSpec,
    /// Overrides the executor's timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Traffic affected, matched against gate priority rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<TrafficSelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
    Conditional,
}

impl Node {
    pub fn trigger(id: impl Into<String>, trigger: TriggerSpec) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            kind: NodeKind::Trigger { trigger },
        }
    }

    pub fn action(id: impl Into<String>, action: ActionSpec) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            kind: NodeKind::Action(ActionNode {
                action,
                timeout_secs: None,
                traffic: None,
            }),
        }
    }

    pub fn outcome(id: impl Into<String>, outcome: OutcomeKind) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            kind: NodeKind::Outcome { outcome },
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the timeout on an action node. No-op on other kinds.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        if let NodeKind::Action(a) = &mut self.kind {
            a.timeout_secs = Some(secs);
        }
        self
    }

    /// Set the traffic selector on an action node. No-op on other kinds.
    pub fn with_traffic(mut self, traffic: TrafficSelector) -> Self {
        if let NodeKind::Action(a) = &mut self.kind {
            a.traffic = Some(traffic);
        }
        self
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self.kind, NodeKind::Trigger { .. })
    }

    pub fn is_action(&self) -> bool {
        matches!(self.kind, NodeKind::Action(_))
    }

    pub fn is_outcome(&self) -> bool {
        matches!(self.kind, NodeKind::Outcome { .. })
    }

    pub fn as_action(&self) -> Option<&ActionNode> {
        match &self.kind {
            NodeKind::Action(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_trigger(&self) -> Option<&TriggerSpec> {
        match &self.kind {
            NodeKind::Trigger { trigger } => Some(trigger),
            _ => None,
        }
    }

    pub fn outcome_kind(&self) -> Option<OutcomeKind> {
        match &self.kind {
            NodeKind::Outcome { outcome } => Some(*outcome),
            _ => None,
        }
    }

    pub fn action_kind(&self) -> Option<ActionKind> {
        self.as_action().map(|a| a.action.kind())
    }
}
