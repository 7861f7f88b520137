use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tripwire_core::types::{FlowId, RunId};

use crate::condition::ThresholdPolicy;
use crate::engine::Engine;
use crate::graph::{TriggerSpec, ValidGraph};

/// Result of one trigger fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FireResult {
    /// A run was created.
    Started {
        flow_id: FlowId,
        trigger_id: String,
        run_id: RunId,
    },
    /// Dropped because the flow already has a run in flight.
    Skipped {
        flow_id: FlowId,
        trigger_id: String,
        in_flight: RunId,
    },
}

impl FireResult {
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Started { run_id, .. } => Some(run_id),
            Self::Skipped { .. } => None,
        }
    }
}

/// At most one in-flight run per flow.
///
/// A suspended run keeps its flow's lock until it is resumed to completion
/// or cancelled.
#[derive(Debug, Default)]
pub struct FlowLocks {
    held: Mutex<HashMap<FlowId, RunId>>,
}

impl FlowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `run`, or return the run holding it.
    pub fn try_acquire(&self, flow: &FlowId, run: &RunId) -> Result<(), RunId> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        match held.get(flow) {
            Some(holder) if holder != run => Err(holder.clone()),
            _ => {
                held.insert(flow.clone(), run.clone());
                Ok(())
            }
        }
    }

    /// Release the lock if `run` holds it.
    pub fn release(&self, flow: &FlowId, run: &RunId) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(flow) == Some(run) {
            held.remove(flow);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
struct ScheduledTrigger {
    flow_id: FlowId,
    trigger_id: String,
    schedule: Schedule,
}

/// Condition trigger subscribed to a metric source.
#[derive(Debug, Clone)]
pub struct ConditionSubscription {
    pub flow_id: FlowId,
    pub trigger_id: String,
    pub policy: ThresholdPolicy,
}

/// Trigger subscriptions of the active flow set.
#[derive(Debug, Default)]
pub struct TriggerIndex {
    schedules: Vec<ScheduledTrigger>,
    events: HashMap<String, Vec<(FlowId, String)>>,
    conditions: HashMap<String, Vec<ConditionSubscription>>,
}

impl TriggerIndex {
    pub fn build(graphs: &[Arc<ValidGraph>]) -> Self {
        let mut index = Self::default();
        for graph in graphs {
            for (node, trigger) in graph.triggers() {
                match trigger {
                    TriggerSpec::Schedule { cron } => match Schedule::from_str(cron) {
                        Ok(schedule) => index.schedules.push(ScheduledTrigger {
                            flow_id: graph.id().clone(),
                            trigger_id: node.id.clone(),
                            schedule,
                        }),
                        // Validation rejects these; only reachable for hand-built graphs.
                        Err(e) => warn!(
                            flow_id = %graph.id(),
                            trigger = %node.id,
                            error = %e,
                            "Invalid cron expression, trigger ignored"
                        ),
                    },
                    TriggerSpec::Event { source } => index
                        .events
                        .entry(source.clone())
                        .or_default()
                        .push((graph.id().clone(), node.id.clone())),
                    TriggerSpec::Condition { source, policy } => index
                        .conditions
                        .entry(source.clone())
                        .or_default()
                        .push(ConditionSubscription {
                            flow_id: graph.id().clone(),
                            trigger_id: node.id.clone(),
                            policy: policy.clone(),
                        }),
                    TriggerSpec::Manual => {}
                }
            }
        }
        debug!(
            schedules = index.schedules.len(),
            event_sources = index.events.len(),
            condition_sources = index.conditions.len(),
            "Trigger index rebuilt"
        );
        index
    }

    /// Event triggers listening on a source.
    pub fn event_targets(&self, source: &str) -> &[(FlowId, String)] {
        self.events.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Condition triggers evaluating a metric source.
    pub fn condition_targets(&self, source: &str) -> &[ConditionSubscription] {
        self.conditions.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Earliest due time strictly after `after`, with every trigger due then.
    pub fn next_due(&self, after: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<(FlowId, String)>)> {
        let mut next: Option<(DateTime<Utc>, Vec<(FlowId, String)>)> = None;
        for s in &self.schedules {
            let Some(due) = s.schedule.after(&after).next() else {
                continue;
            };
            let entry = (s.flow_id.clone(), s.trigger_id.clone());
            match next.as_mut() {
                Some((t, due_now)) if *t == due => due_now.push(entry),
                Some((t, _)) if *t < due => {}
                _ => next = Some((due, vec![entry])),
            }
        }
        next
    }
}

/// Fires cron triggers and expires stale approvals. Re-plans whenever the
/// active flow set changes.
pub struct Scheduler {
    engine: Arc<Engine>,
    cancel: CancellationToken,
}

/// Upper bound on one sleep so clock jumps are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

impl Scheduler {
    pub fn new(engine: Arc<Engine>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    /// Run the scheduler loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!("Scheduler started");
        loop {
            let now = Utc::now();
            let due = self.engine.next_due(now);
            let expiry = self.engine.approvals().next_expiry().await;

            let wake = match (due.as_ref().map(|(t, _)| *t), expiry) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let delay = wake
                .map(|t| (t - now).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(MAX_SLEEP)
                .min(MAX_SLEEP);

            if let Some((fire_at, triggers)) = &due {
                debug!(
                    fire_at = %fire_at.format("%H:%M:%S"),
                    triggers = triggers.len(),
                    delay_secs = delay.as_secs(),
                    "Next schedule planned"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let now = Utc::now();
                    if let Some((fire_at, triggers)) = due {
                        if fire_at <= now {
                            for (flow_id, trigger_id) in triggers {
                                self.fire(&flow_id, &trigger_id, fire_at).await;
                            }
                        }
                    }
                    self.engine.expire_approvals(now).await;
                }
                _ = self.engine.flows_changed() => {
                    debug!("Active flow set changed, re-planning");
                }
                _ = self.cancel.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn fire(&self, flow_id: &FlowId, trigger_id: &str, due: DateTime<Utc>) {
        info!(flow_id = %flow_id, trigger = trigger_id, "Firing scheduled trigger");
        match self.engine.fire_scheduled(flow_id, trigger_id, due).await {
            Ok(result) => debug!(?result, "Scheduled fire handled"),
            Err(e) => error!(flow_id = %flow_id, trigger = trigger_id, error = %e, "Scheduled fire failed"),
        }
    }
}
