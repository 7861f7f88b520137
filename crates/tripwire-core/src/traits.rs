use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::action::{ActionContext, ActionKind, ActionOutcome, ActionSpec};
use crate::error::Result;
use crate::types::*;

/// Action executor: performs one capability of infrastructure change.
pub trait ActionExecutor: Send + Sync + 'static {
    /// Capability this executor handles.
    fn kind(&self) -> ActionKind;

    /// Perform the action for real.
    fn execute(&self, spec: &ActionSpec, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutcome>>;

    /// Describe what `execute` would do without side effects.
    fn dry_run(&self, spec: &ActionSpec, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutcome>> {
        let _ = ctx;
        let detail = format!("dry run: {}", spec.summary());
        Box::pin(async move { Ok(ActionOutcome::success(detail)) })
    }

    /// Timeout in seconds for this executor. `None` uses the engine default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// A flow version as persisted by the store.
#[derive(Debug, Clone)]
pub struct StoredFlow {
    pub flow_id: FlowId,
    pub version: u64,
    pub definition: serde_json::Value,
}

/// Run store: durable, append-only run history plus in-flight checkpoints.
pub trait RunStore: Send + Sync + 'static {
    /// Persist in-flight run state, replacing any previous checkpoint.
    fn checkpoint(&self, cp: &RunCheckpoint) -> BoxFuture<'_, Result<()>>;

    /// Append a terminal run and drop its checkpoint. Appending the same run
    /// twice is an error.
    fn append(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>>;

    /// Terminal record or in-flight checkpoint for a run.
    fn get(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>>;

    /// Runs of a flow, newest first.
    fn list(&self, flow_id: &FlowId, filter: &RunFilter) -> BoxFuture<'_, Result<Vec<RunRecord>>>;

    /// Checkpoint of one in-flight run.
    fn load_checkpoint(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunCheckpoint>>>;

    /// All checkpointed (non-terminal) runs.
    fn in_flight(&self) -> BoxFuture<'_, Result<Vec<RunCheckpoint>>>;

    /// (succeeded, failed) executions of an action kind since a time, live runs only.
    fn action_stats(
        &self,
        kind: ActionKind,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<(u64, u64)>>;

    /// Whether any run of this flow version was recorded.
    fn has_history(&self, flow_id: &FlowId, version: u64) -> BoxFuture<'_, Result<bool>>;

    /// Persist a flow version definition.
    fn save_flow(&self, flow: StoredFlow) -> BoxFuture<'_, Result<()>>;

    /// Every persisted flow version, oldest version first.
    fn load_flows(&self) -> BoxFuture<'_, Result<Vec<StoredFlow>>>;
}
