use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::ActionKind;
use crate::policy::GateDecision;

/// Identifier of an automation flow (stable across versions).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a flow version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
    Inactive,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// Status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::AwaitingApproval => "awaiting_approval",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "succeeded" | "success" => Ok(Self::Succeeded),
            "failed" | "failure" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

/// Result of a single action node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    /// Capability of the action, used for adaptive-learning statistics.
    pub action: ActionKind,
    pub status: NodeStatus,
    /// Gate summary for gated nodes, executor detail verbatim for executed ones.
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateDecision>,
    #[serde(default)]
    pub simulated: bool,
    pub finished_at: DateTime<Utc>,
}

/// Run lifecycle: `Pending -> Running -> {Completed, Failed, AwaitingApproval}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The decision gate said no. Not an error.
    GateRejection,
    /// Executor reported failure or timed out.
    ActionFailed,
    /// Operator cancellation or approver rejection.
    Cancelled,
    /// A conditional outcome matched no edge. Configuration error.
    NoOutcomeMatched,
    /// The walk reached a `failure` outcome.
    FailureOutcome,
    /// An action was in flight when the engine stopped; its outcome is unknown.
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GateRejection => "gate_rejection",
            Self::ActionFailed => "action_failed",
            Self::Cancelled => "cancelled",
            Self::NoOutcomeMatched => "no_outcome_matched",
            Self::FailureOutcome => "failure_outcome",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Durable record of one execution of a flow, from trigger to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub flow_id: FlowId,
    pub flow_version: u64,
    pub trigger_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub simulated: bool,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub failure_detail: Option<String>,
    /// Terminal outcome node that concluded the run, if any.
    #[serde(default)]
    pub outcome_node: Option<String>,
    /// Failure outcomes fired for cleanup after a halted walk.
    #[serde(default)]
    pub failure_outcomes_fired: Vec<String>,
    #[serde(default)]
    pub node_results: Vec<NodeResult>,
}

impl RunRecord {
    pub fn new(
        flow_id: FlowId,
        flow_version: u64,
        trigger_id: impl Into<String>,
        simulated: bool,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            flow_id,
            flow_version,
            trigger_id: trigger_id.into(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            simulated,
            failure: None,
            failure_detail: None,
            outcome_node: None,
            failure_outcomes_fired: vec![],
            node_results: vec![],
        }
    }

    pub fn result_for(&self, node_id: &str) -> Option<&NodeResult> {
        self.node_results.iter().rev().find(|r| r.node_id == node_id)
    }

    /// Mark the run terminal. Calling this on a finished record is a no-op.
    pub fn finish(&mut self, status: RunStatus, failure: Option<(FailureReason, String)>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        if let Some((reason, detail)) = failure {
            self.failure = Some(reason);
            self.failure_detail = Some(detail);
        }
    }
}

/// In-flight run state persisted after every step so a run can be resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub record: RunRecord,
    /// Executor-private walk state.
    pub walk: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Filter for listing runs of a flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// What caused a trigger to fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FireCause {
    Schedule { due: DateTime<Utc> },
    Event { source: String },
    Condition { source: String },
    Manual,
    Recovery,
}

/// A pending approval for a suspended run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: RunId,
    pub flow_id: FlowId,
    pub flow_version: u64,
    pub node_id: String,
    pub action: ActionKind,
    pub summary: String,
    pub confidence: u8,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Decision on an approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: String },
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A flow version was admitted.
    FlowAdmitted { flow_id: FlowId, version: u64, status: FlowStatus },
    /// A flow version was retired.
    FlowRetired { flow_id: FlowId, version: u64 },
    /// A trigger fired and a run was created.
    TriggerFired { flow_id: FlowId, trigger_id: String, run_id: RunId, cause: FireCause },
    /// A fire was dropped because the flow already has a run in flight.
    FireSkipped { flow_id: FlowId, trigger_id: String, in_flight: RunId },
    /// Run transitioned to `Running`.
    RunStarted { run_id: RunId, flow_id: FlowId },
    /// The gate decided on an action.
    GateDecided {
        run_id: RunId,
        node_id: String,
        decision: GateDecision,
        confidence: u8,
        simulated: bool,
    },
    /// An action node finished (any status).
    NodeFinished { run_id: RunId, node_id: String, status: NodeStatus, detail: String },
    /// Approval requested for a suspended run.
    ApprovalRequested { request: ApprovalRequest },
    /// Approval resolved (approved or denied).
    ApprovalResolved { run_id: RunId, approved: bool },
    /// A failure outcome fired for cleanup/notification.
    FailureOutcomeFired { run_id: RunId, node_id: String },
    /// Flow configuration problem detected at run time (e.g. no outcome matched).
    ConfigurationError { flow_id: FlowId, run_id: Option<RunId>, detail: String },
    /// A metric sample was excluded from evaluation.
    SampleRejected { source: String, reason: String },
    /// Run reached a terminal state and was recorded.
    RunFinished {
        run_id: RunId,
        flow_id: FlowId,
        status: RunStatus,
        failure: Option<FailureReason>,
    },
    /// Run was re-attached after an engine restart.
    RunRecovered { run_id: RunId, status: RunStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_idempotent() {
        let mut rec = RunRecord::new(FlowId::from_string("f"), 1, "t", false);
        rec.finish(
            RunStatus::Failed,
            Some((FailureReason::Cancelled, "first".into())),
        );
        let finished_at = rec.finished_at;
        rec.finish(RunStatus::Completed, None);
        assert_eq!(rec.status, RunStatus::Failed);
        assert_eq!(rec.failure_detail.as_deref(), Some("first"));
        assert_eq!(rec.finished_at, finished_at);
    }

    #[test]
    fn status_parse_accepts_dashes() {
        assert_eq!(
            "awaiting-approval".parse::<RunStatus>().unwrap(),
            RunStatus::AwaitingApproval
        );
        assert_eq!("success".parse::<NodeStatus>().unwrap(), NodeStatus::Succeeded);
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::AwaitingApproval.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
