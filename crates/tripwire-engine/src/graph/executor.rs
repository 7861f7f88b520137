use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tripwire_core::action::{ActionContext, ActionKind, ActionOutcome};
use tripwire_core::config::EngineConfig;
use tripwire_core::error::{Result, TripwireError};
use tripwire_core::event::EventBus;
use tripwire_core::policy::{GateDecision, GatePolicy};
use tripwire_core::traits::RunStore;
use tripwire_core::types::*;

use super::node::{ActionNode, NodeKind, OutcomeKind};
use super::validate::ValidGraph;
use crate::approval::ApprovalBroker;
use crate::gate::{ConfidenceBasis, DecisionGate, Verdict};
use crate::registry::ExecutorRegistry;

/// Where a run stopped after being driven.
#[derive(Debug, Clone)]
pub enum RunStep {
    /// Terminal and appended to the store.
    Finished(RunRecord),
    /// Waiting on an approver; checkpointed.
    Suspended(RunRecord),
}

impl RunStep {
    pub fn record(&self) -> &RunRecord {
        match self {
            Self::Finished(r) | Self::Suspended(r) => r,
        }
    }

    pub fn into_record(self) -> RunRecord {
        match self {
            Self::Finished(r) | Self::Suspended(r) => r,
        }
    }
}

/// Executor-private progress of a walk, stored in the run checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalkState {
    trigger_id: String,
    basis: ConfidenceBasis,
    /// Policy snapshot taken when the run was created.
    policy: GatePolicy,
    /// Nodes activated by a fired incoming edge.
    #[serde(default)]
    activated: BTreeSet<String>,
    /// Nodes already processed.
    #[serde(default)]
    done: BTreeSet<String>,
    /// Action whose executor was invoked but has not reported back.
    #[serde(default)]
    in_flight: Option<String>,
    /// Approval the run is suspended on.
    #[serde(default)]
    pending: Option<ApprovalRequest>,
    /// Approved action that runs next without consulting the gate.
    #[serde(default)]
    approved: Option<ApprovalRequest>,
}

/// How a single executor invocation ended.
struct Invocation {
    outcome: ActionOutcome,
    cancelled: bool,
}

enum Race {
    Done(Option<Result<ActionOutcome>>),
    Cancelled,
}

/// Drives runs of validated flows: gate, execute, branch, record.
///
/// Every step is checkpointed so a run can be picked up by `drive` after
/// an engine restart.
pub struct FlowExecutor {
    registry: Arc<ExecutorRegistry>,
    store: Arc<dyn RunStore>,
    approvals: Arc<ApprovalBroker>,
    event_bus: Arc<EventBus>,
    default_timeout_secs: u64,
    cancel_grace: Duration,
}

impl FlowExecutor {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        store: Arc<dyn RunStore>,
        approvals: Arc<ApprovalBroker>,
        event_bus: Arc<EventBus>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            approvals,
            event_bus,
            default_timeout_secs: config.default_action_timeout_secs,
            cancel_grace: Duration::from_secs(config.cancel_grace_secs),
        }
    }

    /// Create a `Pending` run for a fired trigger and checkpoint it.
    pub async fn start(
        &self,
        graph: &ValidGraph,
        trigger_id: &str,
        policy: &GatePolicy,
        basis: ConfidenceBasis,
        run_id: RunId,
    ) -> Result<RunRecord> {
        let is_trigger = graph.node(trigger_id).is_some_and(|n| n.is_trigger());
        if !is_trigger {
            return Err(TripwireError::TriggerNotFound {
                flow: graph.id().to_string(),
                trigger: trigger_id.to_string(),
            });
        }

        let mut record = RunRecord::new(
            graph.id().clone(),
            graph.version(),
            trigger_id,
            policy.simulation_mode_enabled,
        );
        record.run_id = run_id;
        let state = WalkState {
            trigger_id: trigger_id.to_string(),
            basis,
            policy: policy.clone(),
            activated: graph.outgoing(trigger_id).map(|e| e.to.clone()).collect(),
            done: BTreeSet::new(),
            in_flight: None,
            pending: None,
            approved: None,
        };
        self.checkpoint(&record, &state).await?;
        debug!(run_id = %record.run_id, flow_id = %record.flow_id, trigger = trigger_id, "Run created");
        Ok(record)
    }

    /// Drive a checkpointed run as far as it goes.
    ///
    /// `graph` is `None` when the run's flow version can no longer be loaded;
    /// the run is then finalized as interrupted. A suspended run is re-queued
    /// with the approval broker and left suspended. An action found in flight
    /// is never re-invoked.
    pub async fn drive(
        &self,
        graph: Option<&ValidGraph>,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<RunStep> {
        let cp = self.load(run_id).await?;
        let Some(graph) = graph else {
            let detail = format!(
                "flow {} version {} is no longer available",
                cp.record.flow_id, cp.record.flow_version
            );
            warn!(run_id = %run_id, "{}", detail);
            return self
                .abandon(None, run_id, FailureReason::Interrupted, detail)
                .await
                .map(RunStep::Finished);
        };
        let mut record = cp.record;
        let mut state: WalkState = match serde_json::from_value(cp.walk) {
            Ok(state) => state,
            Err(e) => {
                let detail = format!("unreadable walk state: {}", e);
                warn!(run_id = %run_id, "{}", detail);
                return self
                    .halt_with(None, record, None, FailureReason::Interrupted, detail)
                    .await
                    .map(RunStep::Finished);
            }
        };

        if record.status == RunStatus::AwaitingApproval {
            if let Some(req) = &state.pending {
                if !self.approvals.is_pending(run_id).await {
                    self.approvals.restore(req.clone()).await;
                }
            }
            return Ok(RunStep::Suspended(record));
        }

        if let Some(node_id) = state.in_flight.take() {
            let detail = format!(
                "interrupted: engine stopped while '{}' was in flight, outcome unknown",
                node_id
            );
            warn!(run_id = %record.run_id, node = %node_id, "Action was in flight at recovery, not re-running");
            let kind = action_kind(graph, &node_id);
            push_result(&mut record, &node_id, kind, NodeStatus::Failed, detail.clone(), None, None);
            return self
                .halt(graph, record, &state, Some(node_id.as_str()), FailureReason::Interrupted, detail)
                .await
                .map(RunStep::Finished);
        }

        if record.status == RunStatus::Pending {
            record.status = RunStatus::Running;
            self.checkpoint(&record, &state).await?;
            self.event_bus.publish(EngineEvent::RunStarted {
                run_id: record.run_id.clone(),
                flow_id: record.flow_id.clone(),
            });
            info!(run_id = %record.run_id, flow_id = %record.flow_id, "Run started");
        }

        self.walk(graph, record, state, cancel).await
    }

    /// Resume a suspended run whose approval was granted.
    pub async fn resume_approved(
        &self,
        graph: &ValidGraph,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<RunStep> {
        let cp = self.load(run_id).await?;
        let mut record = cp.record;
        let mut state: WalkState = serde_json::from_value(cp.walk)?;
        let pending = match (record.status, state.pending.take()) {
            (RunStatus::AwaitingApproval, Some(p)) => p,
            _ => return Err(TripwireError::NotAwaitingApproval(run_id.to_string())),
        };

        clear_awaiting(&mut record, &pending.node_id);
        info!(run_id = %run_id, node = %pending.node_id, "Approval granted, resuming run");
        state.approved = Some(pending);
        record.status = RunStatus::Running;
        self.checkpoint(&record, &state).await?;
        self.walk(graph, record, state, cancel).await
    }

    /// End a suspended or not-yet-running run without executing anything more.
    ///
    /// Used for approver rejection, expired approvals, operator
    /// cancellation of runs that hold no task, and runs whose task errored.
    /// An action left in flight is recorded failed.
    pub async fn abandon(
        &self,
        graph: Option<&ValidGraph>,
        run_id: &RunId,
        reason: FailureReason,
        detail: String,
    ) -> Result<RunRecord> {
        let cp = self.load(run_id).await?;
        let mut record = cp.record;
        let state = serde_json::from_value::<WalkState>(cp.walk).ok();

        let at = state
            .as_ref()
            .and_then(|s| s.pending.as_ref())
            .map(|p| (p.node_id.clone(), p.action, p.confidence));
        if let Some((node_id, kind, confidence)) = &at {
            clear_awaiting(&mut record, node_id);
            push_result(
                &mut record,
                node_id,
                *kind,
                NodeStatus::Failed,
                detail.clone(),
                Some(*confidence),
                Some(GateDecision::QueueForApproval),
            );
        }

        let in_flight = state.as_ref().and_then(|s| s.in_flight.clone());
        if let Some(node_id) = &in_flight {
            let kind = graph.map_or(ActionKind::Script, |g| action_kind(g, node_id));
            push_result(&mut record, node_id, kind, NodeStatus::Failed, format!("interrupted: {}", detail), None, None);
        }

        let walk = match (graph, state.as_ref()) {
            (Some(g), Some(s)) => Some((Some(g), s)),
            (None, Some(s)) => Some((None, s)),
            _ => None,
        };
        let at = at.map(|(node_id, _, _)| node_id).or(in_flight);
        self.halt_with(walk, record, at.as_deref(), reason, detail).await
    }

    async fn walk(
        &self,
        graph: &ValidGraph,
        mut record: RunRecord,
        mut state: WalkState,
        cancel: &CancellationToken,
    ) -> Result<RunStep> {
        let gate = DecisionGate::new(Arc::new(state.policy.clone()), self.store.clone());

        for node_id in graph.order() {
            if state.done.contains(node_id) || !state.activated.contains(node_id) {
                continue;
            }
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            if cancel.is_cancelled() {
                info!(run_id = %record.run_id, "Run cancelled before '{}'", node_id);
                return self
                    .halt(graph, record, &state, None, FailureReason::Cancelled, "cancelled by operator".into())
                    .await
                    .map(RunStep::Finished);
            }

            match &node.kind {
                // Edges into triggers do not start anything.
                NodeKind::Trigger { .. } => {
                    state.done.insert(node_id.clone());
                }
                NodeKind::Action(action) => {
                    let kind = action.action.kind();
                    let approved = state
                        .approved
                        .take()
                        .filter(|a| &a.node_id == node_id);

                    let verdict = match &approved {
                        Some(_) => None,
                        None => Some(gate.evaluate(action, &state.basis).await?),
                    };

                    if let Some(v) = &verdict {
                        self.event_bus.publish(EngineEvent::GateDecided {
                            run_id: record.run_id.clone(),
                            node_id: node_id.clone(),
                            decision: v.decision,
                            confidence: v.confidence,
                            simulated: v.simulated,
                        });
                        debug!(run_id = %record.run_id, node = %node_id, "{}", v);

                        match v.decision {
                            GateDecision::Reject => {
                                let detail = v.to_string();
                                push_result(&mut record, node_id, kind, NodeStatus::Failed, detail.clone(), Some(v.confidence), Some(v.decision));
                                self.node_finished(&record, node_id, NodeStatus::Failed, &detail);
                                info!(run_id = %record.run_id, node = %node_id, confidence = v.confidence, "Gate rejected action");
                                return self
                                    .halt(graph, record, &state, Some(node_id.as_str()), FailureReason::GateRejection, detail)
                                    .await
                                    .map(RunStep::Finished);
                            }
                            GateDecision::QueueForApproval => {
                                return self.suspend(record, state, node_id, action, v).await;
                            }
                            GateDecision::AutoExecute => {}
                        }
                    }

                    let inv = self.invoke(&mut record, &mut state, node_id, action, cancel).await?;
                    let detail = match &verdict {
                        Some(v) if v.simulated => format!("{} [{}]", inv.outcome.detail, v),
                        _ => inv.outcome.detail.clone(),
                    };
                    let status = if inv.outcome.succeeded {
                        NodeStatus::Succeeded
                    } else {
                        NodeStatus::Failed
                    };
                    let (confidence, decision) = match (&verdict, &approved) {
                        (Some(v), _) => (Some(v.confidence), Some(v.decision)),
                        (None, Some(a)) => (Some(a.confidence), Some(GateDecision::QueueForApproval)),
                        (None, None) => (None, None),
                    };
                    push_result(&mut record, node_id, kind, status, detail.clone(), confidence, decision);
                    self.node_finished(&record, node_id, status, &detail);

                    if inv.cancelled {
                        return self
                            .halt(graph, record, &state, Some(node_id.as_str()), FailureReason::Cancelled, "cancelled by operator".into())
                            .await
                            .map(RunStep::Finished);
                    }
                    if !inv.outcome.succeeded {
                        info!(run_id = %record.run_id, node = %node_id, "Action failed: {}", inv.outcome.detail);
                        return self
                            .halt(graph, record, &state, Some(node_id.as_str()), FailureReason::ActionFailed, inv.outcome.detail)
                            .await
                            .map(RunStep::Finished);
                    }

                    // Failure outcomes downstream of an action only fire when it halts.
                    state.done.insert(node_id.clone());
                    state.activated.extend(
                        graph
                            .outgoing(node_id)
                            .filter(|e| !is_failure_outcome(graph, &e.to))
                            .map(|e| e.to.clone()),
                    );
                    self.checkpoint(&record, &state).await?;
                }
                NodeKind::Outcome { outcome } => match outcome {
                    OutcomeKind::Success => {
                        state.done.insert(node_id.clone());
                        record.outcome_node = Some(node_id.clone());
                        return self
                            .conclude(Some((Some(graph), &state)), record, RunStatus::Completed, None)
                            .await
                            .map(RunStep::Finished);
                    }
                    OutcomeKind::Failure => {
                        state.done.insert(node_id.clone());
                        record.outcome_node = Some(node_id.clone());
                        self.fire_failure_outcome(&mut record, node_id);
                        let detail = format!("reached failure outcome '{}'", node_id);
                        return self
                            .conclude(
                                Some((Some(graph), &state)),
                                record,
                                RunStatus::Failed,
                                Some((FailureReason::FailureOutcome, detail)),
                            )
                            .await
                            .map(RunStep::Finished);
                    }
                    OutcomeKind::Conditional => {
                        let edges: Vec<_> = graph.outgoing(node_id).collect();
                        let chosen = edges
                            .iter()
                            .find(|e| e.guard.as_ref().is_some_and(|g| g.matches(&record.node_results)))
                            .or_else(|| edges.iter().find(|e| e.guard.is_none()));
                        match chosen {
                            Some(edge) => {
                                debug!(run_id = %record.run_id, node = %node_id, to = %edge.to, "Conditional branch selected");
                                state.done.insert(node_id.clone());
                                state.activated.insert(edge.to.clone());
                                self.checkpoint(&record, &state).await?;
                            }
                            None => {
                                let detail = format!("conditional outcome '{}' matched no outgoing edge", node_id);
                                warn!(run_id = %record.run_id, flow_id = %record.flow_id, "{}", detail);
                                self.event_bus.publish(EngineEvent::ConfigurationError {
                                    flow_id: record.flow_id.clone(),
                                    run_id: Some(record.run_id.clone()),
                                    detail: detail.clone(),
                                });
                                return self
                                    .halt(graph, record, &state, Some(node_id.as_str()), FailureReason::NoOutcomeMatched, detail)
                                    .await
                                    .map(RunStep::Finished);
                            }
                        }
                    }
                },
            }
        }

        // Ran out of activated nodes without reaching a terminal outcome.
        self.conclude(Some((Some(graph), &state)), record, RunStatus::Completed, None)
            .await
            .map(RunStep::Finished)
    }

    async fn suspend(
        &self,
        mut record: RunRecord,
        mut state: WalkState,
        node_id: &str,
        action: &ActionNode,
        verdict: &Verdict,
    ) -> Result<RunStep> {
        let now = Utc::now();
        let request = ApprovalRequest {
            run_id: record.run_id.clone(),
            flow_id: record.flow_id.clone(),
            flow_version: record.flow_version,
            node_id: node_id.to_string(),
            action: action.action.kind(),
            summary: action.action.summary(),
            confidence: verdict.confidence,
            reason: verdict.to_string(),
            requested_at: now,
            expires_at: state
                .policy
                .approval_timeout_secs
                .map(|s| now + chrono::Duration::seconds(s as i64)),
        };

        let detail = verdict.to_string();
        push_result(
            &mut record,
            node_id,
            action.action.kind(),
            NodeStatus::AwaitingApproval,
            detail.clone(),
            Some(verdict.confidence),
            Some(verdict.decision),
        );
        self.node_finished(&record, node_id, NodeStatus::AwaitingApproval, &detail);

        record.status = RunStatus::AwaitingApproval;
        state.pending = Some(request.clone());
        self.checkpoint(&record, &state).await?;
        self.approvals.request(request).await;

        info!(run_id = %record.run_id, node = %node_id, confidence = verdict.confidence, "Run awaiting approval");
        Ok(RunStep::Suspended(record))
    }

    /// Invoke the executor for an action with timeout and cooperative cancel.
    async fn invoke(
        &self,
        record: &mut RunRecord,
        state: &mut WalkState,
        node_id: &str,
        action: &ActionNode,
        cancel: &CancellationToken,
    ) -> Result<Invocation> {
        let kind = action.action.kind();
        let Some(executor) = self.registry.get(kind) else {
            let outcome = if record.simulated {
                ActionOutcome::success(format!("dry run: {}", action.action.summary()))
            } else {
                ActionOutcome::failure(TripwireError::ExecutorNotFound(kind.to_string()).to_string())
            };
            return Ok(Invocation {
                outcome,
                cancelled: false,
            });
        };

        let timeout_secs = action
            .timeout_secs
            .or_else(|| executor.timeout_secs())
            .unwrap_or(self.default_timeout_secs)
            .max(1);
        let ctx = ActionContext {
            run_id: record.run_id.clone(),
            flow_id: record.flow_id.clone(),
            node_id: node_id.to_string(),
            simulated: record.simulated,
        };

        state.in_flight = Some(node_id.to_string());
        self.checkpoint(record, state).await?;
        debug!(run_id = %record.run_id, node = %node_id, action = %kind, timeout_secs, simulated = record.simulated, "Invoking executor");

        let mut fut = if record.simulated {
            executor.dry_run(&action.action, ctx)
        } else {
            executor.execute(&action.action, ctx)
        };

        let race = tokio::select! {
            res = tokio::time::timeout(Duration::from_secs(timeout_secs), &mut fut) => Race::Done(res.ok()),
            _ = cancel.cancelled() => Race::Cancelled,
        };
        let (result, cancelled) = match race {
            Race::Done(result) => (result, false),
            Race::Cancelled => {
                debug!(run_id = %record.run_id, node = %node_id, grace_secs = self.cancel_grace.as_secs(), "Cancel requested, waiting for in-flight action");
                (tokio::time::timeout(self.cancel_grace, &mut fut).await.ok(), true)
            }
        };
        drop(fut);
        state.in_flight = None;

        let outcome = match result {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => ActionOutcome::failure(e.to_string()),
            None if cancelled => ActionOutcome::failure(format!(
                "cancelled: action did not finish within the {}s grace period",
                self.cancel_grace.as_secs()
            )),
            None => ActionOutcome::failure(
                TripwireError::ActionTimeout {
                    action: kind.to_string(),
                    timeout_secs,
                }
                .to_string(),
            ),
        };
        Ok(Invocation { outcome, cancelled })
    }

    /// Fail the run at `at`, firing pending failure outcomes for cleanup.
    async fn halt(
        &self,
        graph: &ValidGraph,
        record: RunRecord,
        state: &WalkState,
        at: Option<&str>,
        reason: FailureReason,
        detail: String,
    ) -> Result<RunRecord> {
        self.halt_with(Some((Some(graph), state)), record, at, reason, detail)
            .await
    }

    async fn halt_with(
        &self,
        walk: Option<(Option<&ValidGraph>, &WalkState)>,
        mut record: RunRecord,
        at: Option<&str>,
        reason: FailureReason,
        detail: String,
    ) -> Result<RunRecord> {
        if let Some((Some(graph), state)) = walk {
            let mut candidates: BTreeSet<&str> = state
                .activated
                .iter()
                .filter(|id| !state.done.contains(*id))
                .map(String::as_str)
                .collect();
            if let Some(at) = at {
                candidates.extend(graph.outgoing(at).map(|e| e.to.as_str()));
            }
            let mut failures: Vec<&str> = candidates
                .into_iter()
                .filter(|id| is_failure_outcome(graph, id))
                .collect();
            failures.sort_by_key(|id| graph.position(id));
            for id in failures {
                self.fire_failure_outcome(&mut record, id);
            }
        }
        self.conclude(walk, record, RunStatus::Failed, Some((reason, detail)))
            .await
    }

    fn fire_failure_outcome(&self, record: &mut RunRecord, node_id: &str) {
        if record.failure_outcomes_fired.iter().any(|n| n == node_id) {
            return;
        }
        record.failure_outcomes_fired.push(node_id.to_string());
        self.event_bus.publish(EngineEvent::FailureOutcomeFired {
            run_id: record.run_id.clone(),
            node_id: node_id.to_string(),
        });
    }

    /// Mark unreached actions skipped, finish the record and append it once.
    async fn conclude(
        &self,
        walk: Option<(Option<&ValidGraph>, &WalkState)>,
        mut record: RunRecord,
        status: RunStatus,
        failure: Option<(FailureReason, String)>,
    ) -> Result<RunRecord> {
        if let Some((Some(graph), state)) = walk {
            let reachable = graph.reachable_from(&state.trigger_id);
            for id in graph.order() {
                let Some(kind) = graph.node(id).and_then(|n| n.action_kind()) else {
                    continue;
                };
                if reachable.contains(id) && record.result_for(id).is_none() {
                    push_result(&mut record, id, kind, NodeStatus::Skipped, "not reached".into(), None, None);
                }
            }
        }

        record.finish(status, failure);
        self.store.append(&record).await?;
        self.event_bus.publish(EngineEvent::RunFinished {
            run_id: record.run_id.clone(),
            flow_id: record.flow_id.clone(),
            status: record.status,
            failure: record.failure,
        });
        match (record.failure, &record.failure_detail) {
            (Some(reason), Some(detail)) => {
                info!(run_id = %record.run_id, flow_id = %record.flow_id, %reason, "Run failed: {}", detail)
            }
            _ => info!(run_id = %record.run_id, flow_id = %record.flow_id, status = %record.status, "Run finished"),
        }
        Ok(record)
    }

    fn node_finished(&self, record: &RunRecord, node_id: &str, status: NodeStatus, detail: &str) {
        self.event_bus.publish(EngineEvent::NodeFinished {
            run_id: record.run_id.clone(),
            node_id: node_id.to_string(),
            status,
            detail: detail.to_string(),
        });
    }

    async fn checkpoint(&self, record: &RunRecord, state: &WalkState) -> Result<()> {
        self.store
            .checkpoint(&RunCheckpoint {
                record: record.clone(),
                walk: serde_json::to_value(state)?,
                updated_at: Utc::now(),
            })
            .await
    }

    async fn load(&self, run_id: &RunId) -> Result<RunCheckpoint> {
        self.store
            .load_checkpoint(run_id)
            .await?
            .ok_or_else(|| TripwireError::RunNotFound(run_id.to_string()))
    }
}

fn action_kind(graph: &ValidGraph, node_id: &str) -> ActionKind {
    graph
        .node(node_id)
        .and_then(|n| n.action_kind())
        .unwrap_or(ActionKind::Script)
}

fn is_failure_outcome(graph: &ValidGraph, node_id: &str) -> bool {
    graph
        .node(node_id)
        .and_then(|n| n.outcome_kind())
        .is_some_and(|k| k == OutcomeKind::Failure)
}

fn clear_awaiting(record: &mut RunRecord, node_id: &str) {
    record
        .node_results
        .retain(|r| !(r.node_id == node_id && r.status == NodeStatus::AwaitingApproval));
}

fn push_result(
    record: &mut RunRecord,
    node_id: &str,
    action: ActionKind,
    status: NodeStatus,
    detail: String,
    confidence: Option<u8>,
    gate: Option<GateDecision>,
) {
    record.node_results.push(NodeResult {
        node_id: node_id.to_string(),
        action,
        status,
        detail,
        confidence,
        gate,
        simulated: record.simulated,
        finished_at: Utc::now(),
    });
}
