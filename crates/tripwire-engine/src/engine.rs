use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{futures::Notified, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tripwire_core::config::AppConfig;
use tripwire_core::error::{Result, TripwireError};
use tripwire_core::event::EventBus;
use tripwire_core::metric::MetricSample;
use tripwire_core::policy::GatePolicy;
use tripwire_core::traits::{RunStore, StoredFlow};
use tripwire_core::types::*;

use crate::approval::ApprovalBroker;
use crate::condition::{self, SampleWindow};
use crate::flows::{FlowRegistry, FlowSummary};
use crate::gate::ConfidenceBasis;
use crate::graph::{validate, AuthoringFlow, FlowExecutor, FlowGraph, RunStep, ValidGraph};
use crate::registry::ExecutorRegistry;
use crate::scheduler::{FireResult, FlowLocks, TriggerIndex};

/// How a spawned run task continues.
#[derive(Debug, Clone, Copy)]
enum Continue {
    Drive,
    Approved,
}

/// The automation engine: flow admission, trigger fan-out, run workers,
/// approvals and run queries.
///
/// Always used behind an `Arc`; run tasks hold a clone.
pub struct Engine {
    default_policy: GatePolicy,
    retention_secs: u64,
    max_samples: usize,
    flows: RwLock<FlowRegistry>,
    index: RwLock<TriggerIndex>,
    windows: Mutex<HashMap<String, SampleWindow>>,
    store: Arc<dyn RunStore>,
    executor: FlowExecutor,
    approvals: Arc<ApprovalBroker>,
    event_bus: Arc<EventBus>,
    locks: FlowLocks,
    workers: Arc<Semaphore>,
    /// Cancel tokens of runs on worker slots, tagged with the task that owns them.
    running: Mutex<HashMap<RunId, (u64, CancellationToken)>>,
    task_seq: AtomicU64,
    flows_changed: Notify,
}

impl Engine {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn RunStore>,
        registry: ExecutorRegistry,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let approvals = Arc::new(ApprovalBroker::new(event_bus.clone()));
        let executor = FlowExecutor::new(
            Arc::new(registry),
            store.clone(),
            approvals.clone(),
            event_bus.clone(),
            &config.engine,
        );
        Arc::new(Self {
            default_policy: config.gate.clone(),
            retention_secs: config.engine.metric_retention_secs,
            max_samples: config.engine.max_samples_per_source,
            flows: RwLock::new(FlowRegistry::new()),
            index: RwLock::new(TriggerIndex::default()),
            windows: Mutex::new(HashMap::new()),
            store,
            executor,
            approvals,
            event_bus,
            locks: FlowLocks::new(),
            workers: Arc::new(Semaphore::new(config.engine.max_concurrent_runs.max(1))),
            running: Mutex::new(HashMap::new()),
            task_seq: AtomicU64::new(0),
            flows_changed: Notify::new(),
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }

    // -- flow authoring ------------------------------------------------------

    /// Validate and admit a flow version. Nothing is admitted on error.
    pub async fn submit(&self, flow: FlowGraph) -> Result<FlowSummary> {
        let graph = validate(&flow).map_err(TripwireError::Validation)?;
        let has_history = self.store.has_history(&flow.id, flow.version).await?;
        let admission = self.write_flows().admit(graph, has_history)?;

        self.persist(&flow).await?;
        if let Some(old) = admission.deactivated {
            self.persist_status(&flow.id, old, FlowStatus::Inactive).await?;
            self.event_bus.publish(EngineEvent::FlowRetired {
                flow_id: flow.id.clone(),
                version: old,
            });
        }
        self.event_bus.publish(EngineEvent::FlowAdmitted {
            flow_id: admission.flow_id.clone(),
            version: admission.version,
            status: admission.status,
        });
        info!(flow_id = %admission.flow_id, version = admission.version, status = %admission.status, "Flow admitted");

        self.replan();
        self.summary(&flow.id)
    }

    /// Convert an authoring-model graph and submit it.
    pub async fn submit_authoring(&self, flow: AuthoringFlow) -> Result<FlowSummary> {
        let flow = FlowGraph::try_from(flow).map_err(TripwireError::Validation)?;
        self.submit(flow).await
    }

    /// Deactivate the active version of a flow. Returns the retired version.
    pub async fn retire(&self, flow_id: &FlowId) -> Result<u64> {
        let version = self.write_flows().retire(flow_id)?;
        self.persist_status(flow_id, version, FlowStatus::Inactive).await?;
        self.event_bus.publish(EngineEvent::FlowRetired {
            flow_id: flow_id.clone(),
            version,
        });
        info!(flow_id = %flow_id, version, "Flow retired");
        self.replan();
        Ok(version)
    }

    pub fn flows(&self) -> Vec<FlowSummary> {
        self.read_flows().summaries()
    }

    /// Definition of a flow version, or of the latest version.
    pub fn flow(&self, flow_id: &FlowId, version: Option<u64>) -> Result<FlowGraph> {
        let flows = self.read_flows();
        let version = match version {
            Some(v) => v,
            None => flows
                .summaries()
                .into_iter()
                .find(|s| &s.id == flow_id)
                .map(|s| s.latest_version)
                .ok_or_else(|| TripwireError::FlowNotFound(flow_id.to_string()))?,
        };
        let graph = flows
            .get(flow_id, version)
            .ok_or_else(|| TripwireError::FlowNotFound(format!("{} v{}", flow_id, version)))?;
        let mut flow = graph.flow().clone();
        if let Some(status) = flows.status(flow_id, version) {
            flow.status = status;
        }
        Ok(flow)
    }

    /// Re-admit every persisted flow version, then load JSON files from `dir`.
    ///
    /// Persisted versions come first so recovered runs can find their
    /// version. Files that fail to parse or validate are logged and skipped.
    pub async fn load_flows(&self, dir: Option<&Path>) -> Result<usize> {
        let mut loaded = 0;
        for stored in self.store.load_flows().await? {
            match serde_json::from_value::<FlowGraph>(stored.definition) {
                Ok(flow) => match validate(&flow) {
                    Ok(graph) => {
                        // Persisted versions were admitted once already.
                        if let Err(e) = self.write_flows().admit(graph, false) {
                            warn!(flow_id = %stored.flow_id, version = stored.version, error = %e, "Persisted flow not re-admitted");
                        } else {
                            loaded += 1;
                        }
                    }
                    Err(errors) => warn!(
                        flow_id = %stored.flow_id,
                        version = stored.version,
                        error = %TripwireError::Validation(errors),
                        "Persisted flow no longer validates"
                    ),
                },
                Err(e) => warn!(flow_id = %stored.flow_id, error = %e, "Unreadable persisted flow"),
            }
        }

        if let Some(dir) = dir.filter(|d| d.is_dir()) {
            let mut paths: Vec<_> = std::fs::read_dir(dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|x| x == "json"))
                .collect();
            paths.sort();
            for path in paths {
                match self.submit_file(&path).await {
                    Ok(summary) => {
                        debug!(path = %path.display(), flow_id = %summary.id, "Flow file loaded");
                        loaded += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Flow file skipped"),
                }
            }
        }

        self.replan();
        info!(count = loaded, "Flows loaded");
        Ok(loaded)
    }

    /// Submit a flow from a JSON file in either the execution or the authoring shape.
    pub async fn submit_file(&self, path: &Path) -> Result<FlowSummary> {
        let flow = read_flow_file(path)?;
        self.submit(flow).await
    }

    // -- metric and event ingestion -----------------------------------------

    /// Add a sample to a source's window and fire every condition trigger it breaches.
    pub async fn push(self: &Arc<Self>, source: &str, sample: MetricSample) -> Result<Vec<FireResult>> {
        if sample.is_empty() {
            debug!(source, "Sample carries no usable metric, excluded");
            self.event_bus.publish(EngineEvent::SampleRejected {
                source: source.to_string(),
                reason: "no usable metric value".into(),
            });
            return Ok(vec![]);
        }

        let targets = self.read_index().condition_targets(source).to_vec();
        let fired: Vec<_> = {
            let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            let window = windows
                .entry(source.to_string())
                .or_insert_with(|| SampleWindow::new(self.retention_secs, self.max_samples));
            window.push(sample);
            targets
                .into_iter()
                .filter_map(|sub| {
                    let decision = condition::evaluate(&sub.policy, window);
                    decision.fired.then_some((sub, decision))
                })
                .collect()
        };

        let mut results = Vec::with_capacity(fired.len());
        for (sub, decision) in fired {
            let graph = match self.read_flows().active(&sub.flow_id) {
                Ok(g) => g,
                Err(_) => continue,
            };
            let Some(trigger) = graph.node(&sub.trigger_id).and_then(|n| n.as_trigger()) else {
                continue;
            };
            let basis = ConfidenceBasis::for_trigger(trigger, Some(&decision));
            let cause = FireCause::Condition {
                source: source.to_string(),
            };
            results.push(self.fire(graph, &sub.trigger_id, cause, basis).await?);
        }
        Ok(results)
    }

    /// Fire every event trigger subscribed to a named source.
    pub async fn emit(self: &Arc<Self>, source: &str) -> Result<Vec<FireResult>> {
        let targets = self.read_index().event_targets(source).to_vec();
        let mut results = Vec::with_capacity(targets.len());
        for (flow_id, trigger_id) in targets {
            let Ok(graph) = self.read_flows().active(&flow_id) else {
                continue;
            };
            let cause = FireCause::Event {
                source: source.to_string(),
            };
            results.push(self.fire(graph, &trigger_id, cause, ConfidenceBasis::Baseline).await?);
        }
        Ok(results)
    }

    /// Operator-initiated fire of a trigger on the active version.
    pub async fn fire_manual(self: &Arc<Self>, flow_id: &FlowId, trigger_id: &str) -> Result<FireResult> {
        let graph = self.read_flows().active(flow_id)?;
        self.fire(graph, trigger_id, FireCause::Manual, ConfidenceBasis::Manual)
            .await
    }

    pub(crate) async fn fire_scheduled(
        self: &Arc<Self>,
        flow_id: &FlowId,
        trigger_id: &str,
        due: DateTime<Utc>,
    ) -> Result<FireResult> {
        let graph = self.read_flows().active(flow_id)?;
        self.fire(graph, trigger_id, FireCause::Schedule { due }, ConfidenceBasis::Baseline)
            .await
    }

    async fn fire(
        self: &Arc<Self>,
        graph: Arc<ValidGraph>,
        trigger_id: &str,
        cause: FireCause,
        basis: ConfidenceBasis,
    ) -> Result<FireResult> {
        let flow_id = graph.id().clone();
        let run_id = RunId::new();

        if let Err(in_flight) = self.locks.try_acquire(&flow_id, &run_id) {
            info!(flow_id = %flow_id, trigger = trigger_id, in_flight = %in_flight, "Fire skipped, run in flight");
            self.event_bus.publish(EngineEvent::FireSkipped {
                flow_id: flow_id.clone(),
                trigger_id: trigger_id.to_string(),
                in_flight: in_flight.clone(),
            });
            return Ok(FireResult::Skipped {
                flow_id,
                trigger_id: trigger_id.to_string(),
                in_flight,
            });
        }

        let policy = graph.flow().gate.as_ref().unwrap_or(&self.default_policy);
        if let Err(e) = self
            .executor
            .start(&graph, trigger_id, policy, basis, run_id.clone())
            .await
        {
            self.locks.release(&flow_id, &run_id);
            return Err(e);
        }

        self.event_bus.publish(EngineEvent::TriggerFired {
            flow_id: flow_id.clone(),
            trigger_id: trigger_id.to_string(),
            run_id: run_id.clone(),
            cause,
        });
        info!(flow_id = %flow_id, trigger = trigger_id, run_id = %run_id, "Trigger fired");

        self.spawn_run(graph, run_id.clone(), Continue::Drive);
        Ok(FireResult::Started {
            flow_id,
            trigger_id: trigger_id.to_string(),
            run_id,
        })
    }

    /// Run a checkpointed run on a worker slot.
    fn spawn_run(self: &Arc<Self>, graph: Arc<ValidGraph>, run_id: RunId, how: Continue) {
        let token = CancellationToken::new();
        let task = self.task_seq.fetch_add(1, Ordering::Relaxed);
        self.running_map().insert(run_id.clone(), (task, token.clone()));

        let this = Arc::clone(self);
        tokio::spawn(async move {
            // Runs waiting here stay Pending.
            let permit = this.workers.clone().acquire_owned().await;
            let result = match how {
                Continue::Drive => this.executor.drive(Some(graph.as_ref()), &run_id, &token).await,
                Continue::Approved => this.executor.resume_approved(&graph, &run_id, &token).await,
            };
            drop(permit);
            {
                // An approval may already have handed the run to a newer task.
                let mut running = this.running_map();
                if running.get(&run_id).is_some_and(|(t, _)| *t == task) {
                    running.remove(&run_id);
                }
            }

            match result {
                Ok(RunStep::Finished(rec)) => {
                    this.locks.release(&rec.flow_id, &run_id);
                }
                Ok(RunStep::Suspended(_)) => {}
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Run aborted");
                    let detail = format!("run aborted: {}", e);
                    match this
                        .executor
                        .abandon(Some(graph.as_ref()), &run_id, FailureReason::Interrupted, detail)
                        .await
                    {
                        // No checkpoint left means the run is already terminal.
                        Ok(_) | Err(TripwireError::RunNotFound(_)) => {
                            this.locks.release(graph.id(), &run_id);
                        }
                        // Still checkpointed: the flow stays locked until recovery.
                        Err(e) => error!(run_id = %run_id, error = %e, "Aborted run could not be finalized"),
                    }
                }
            }
        });
    }

    // -- approvals -----------------------------------------------------------

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals.pending_requests().await
    }

    /// Approve a suspended run; it resumes on a worker slot.
    pub async fn approve(self: &Arc<Self>, run_id: &RunId) -> Result<()> {
        let request = self
            .approvals
            .respond(run_id, &ApprovalDecision::Approved)
            .await
            .ok_or_else(|| TripwireError::NotAwaitingApproval(run_id.to_string()))?;

        let graph = self.read_flows().get(&request.flow_id, request.flow_version);
        match graph {
            Some(graph) => {
                info!(run_id = %run_id, node = %request.node_id, "Run approved");
                self.spawn_run(graph, run_id.clone(), Continue::Approved);
            }
            None => {
                let detail = format!(
                    "flow {} version {} is no longer available",
                    request.flow_id, request.flow_version
                );
                self.executor
                    .abandon(None, run_id, FailureReason::Interrupted, detail)
                    .await?;
                self.locks.release(&request.flow_id, run_id);
            }
        }
        Ok(())
    }

    /// Reject a suspended run. It ends `Failed` (cancelled) without executing.
    pub async fn reject(&self, run_id: &RunId, reason: &str) -> Result<RunRecord> {
        let request = self
            .approvals
            .respond(
                run_id,
                &ApprovalDecision::Denied {
                    reason: reason.to_string(),
                },
            )
            .await
            .ok_or_else(|| TripwireError::NotAwaitingApproval(run_id.to_string()))?;

        info!(run_id = %run_id, reason, "Run rejected by approver");
        self.end_suspended(&request, format!("rejected by approver: {}", reason))
            .await
    }

    /// Cancel every approval whose window has closed.
    pub async fn expire_approvals(&self, now: DateTime<Utc>) -> Vec<RunId> {
        let mut expired = Vec::new();
        for run_id in self.approvals.expired(now).await {
            let decision = ApprovalDecision::Denied {
                reason: "approval expired".into(),
            };
            let Some(request) = self.approvals.respond(&run_id, &decision).await else {
                continue;
            };
            warn!(run_id = %run_id, "Approval expired, cancelling run");
            match self.end_suspended(&request, "approval expired".into()).await {
                Ok(_) => expired.push(run_id),
                Err(e) => error!(run_id = %run_id, error = %e, "Failed to cancel expired run"),
            }
        }
        expired
    }

    async fn end_suspended(&self, request: &ApprovalRequest, detail: String) -> Result<RunRecord> {
        let graph = self.read_flows().get(&request.flow_id, request.flow_version);
        let record = self
            .executor
            .abandon(graph.as_deref(), &request.run_id, FailureReason::Cancelled, detail)
            .await?;
        self.locks.release(&request.flow_id, &request.run_id);
        Ok(record)
    }

    // -- cancellation --------------------------------------------------------

    /// Cancel a pending, running or suspended run.
    ///
    /// Running runs stop cooperatively; this returns once cancellation was
    /// requested, not when the run has finished.
    pub async fn cancel(&self, run_id: &RunId) -> Result<()> {
        if let Some(request) = self.approvals.withdraw(run_id).await {
            info!(run_id = %run_id, "Cancelling suspended run");
            self.end_suspended(&request, "cancelled by operator".into())
                .await?;
            return Ok(());
        }

        let token = self.running_map().get(run_id).map(|(_, t)| t.clone());
        if let Some(token) = token {
            info!(run_id = %run_id, "Cancelling run");
            token.cancel();
            return Ok(());
        }

        match self.store.get(run_id).await? {
            Some(_) => Err(TripwireError::NotCancellable(run_id.to_string())),
            None => Err(TripwireError::RunNotFound(run_id.to_string())),
        }
    }

    // -- queries -------------------------------------------------------------

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        self.store.get(run_id).await
    }

    pub async fn list_runs(&self, flow_id: &FlowId, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        self.store.list(flow_id, filter).await
    }

    // -- recovery ------------------------------------------------------------

    /// Re-attach every checkpointed run after a restart.
    ///
    /// Pending and running runs continue on worker slots; suspended runs are
    /// re-queued for approval; runs whose flow version is gone are finalized
    /// as interrupted. Call after `load_flows`.
    pub async fn recover(self: &Arc<Self>) -> Result<Vec<RunId>> {
        let mut recovered = Vec::new();
        for cp in self.store.in_flight().await? {
            let run_id = cp.record.run_id.clone();
            let flow_id = cp.record.flow_id.clone();
            if let Err(holder) = self.locks.try_acquire(&flow_id, &run_id) {
                warn!(run_id = %run_id, holder = %holder, "Flow lock already held during recovery");
            }
            self.event_bus.publish(EngineEvent::RunRecovered {
                run_id: run_id.clone(),
                status: cp.record.status,
            });

            let graph = self.read_flows().get(&flow_id, cp.record.flow_version);
            match (graph, cp.record.status) {
                (Some(graph), RunStatus::Pending | RunStatus::Running) => {
                    info!(run_id = %run_id, flow_id = %flow_id, "Resuming run");
                    self.spawn_run(graph, run_id.clone(), Continue::Drive);
                }
                (graph, _) => {
                    let step = self
                        .executor
                        .drive(graph.as_deref(), &run_id, &CancellationToken::new())
                        .await?;
                    if let RunStep::Finished(_) = step {
                        self.locks.release(&flow_id, &run_id);
                    }
                }
            }
            recovered.push(run_id);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Runs recovered");
        }
        Ok(recovered)
    }

    // -- scheduling hooks ----------------------------------------------------

    pub(crate) fn next_due(&self, after: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<(FlowId, String)>)> {
        self.read_index().next_due(after)
    }

    pub(crate) fn flows_changed(&self) -> Notified<'_> {
        self.flows_changed.notified()
    }

    fn replan(&self) {
        let graphs = self.read_flows().active_graphs();
        *self.index.write().unwrap_or_else(|e| e.into_inner()) = TriggerIndex::build(&graphs);
        self.flows_changed.notify_one();
    }

    // -- helpers -------------------------------------------------------------

    fn summary(&self, flow_id: &FlowId) -> Result<FlowSummary> {
        self.read_flows()
            .summaries()
            .into_iter()
            .find(|s| &s.id == flow_id)
            .ok_or_else(|| TripwireError::FlowNotFound(flow_id.to_string()))
    }

    async fn persist(&self, flow: &FlowGraph) -> Result<()> {
        self.store
            .save_flow(StoredFlow {
                flow_id: flow.id.clone(),
                version: flow.version,
                definition: serde_json::to_value(flow)?,
            })
            .await
    }

    async fn persist_status(&self, flow_id: &FlowId, version: u64, status: FlowStatus) -> Result<()> {
        let graph = self.read_flows().get(flow_id, version);
        let Some(graph) = graph else {
            return Ok(());
        };
        let mut flow = graph.flow().clone();
        flow.status = status;
        self.persist(&flow).await
    }

    fn read_flows(&self) -> std::sync::RwLockReadGuard<'_, FlowRegistry> {
        self.flows.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_flows(&self) -> std::sync::RwLockWriteGuard<'_, FlowRegistry> {
        self.flows.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, TriggerIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn running_map(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, (u64, CancellationToken)>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse a flow file in the execution shape, falling back to the authoring shape.
pub fn read_flow_file(path: &Path) -> Result<FlowGraph> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    match serde_json::from_value::<FlowGraph>(value.clone()) {
        Ok(flow) => Ok(flow),
        Err(direct) => match serde_json::from_value::<AuthoringFlow>(value) {
            Ok(authoring) => FlowGraph::try_from(authoring).map_err(TripwireError::Validation),
            Err(_) => Err(direct.into()),
        },
    }
}
