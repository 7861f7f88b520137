use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tripwire_core::event::EventBus;
use tripwire_core::types::EngineEvent;

/// JSONL audit log of engine events.
///
/// One file per engine start under `log_dir`, one JSON object per line,
/// flushed after every entry so a crash loses nothing already written.
pub struct AuditLog {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct AuditEntry {
    timestamp: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    flow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl AuditEntry {
    fn new(event_type: &'static str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            flow_id: None,
            run_id: None,
            detail: None,
        }
    }

    fn flow(mut self, id: impl ToString) -> Self {
        self.flow_id = Some(id.to_string());
        self
    }

    fn run(mut self, id: impl ToString) -> Self {
        self.run_id = Some(id.to_string());
        self
    }

    fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl AuditLog {
    /// `level` controls verbosity: 1=run summary, 2=+gate and approvals, 3=+per node.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        let mut rx = event_bus.subscribe();
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create audit log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = self.log_dir.join(format!("audit_{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open audit log");
                return;
            }
        };

        info!(path = %log_path.display(), "Audit log started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Audit log cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.entry_for(&event) else {
                                continue;
                            };
                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write audit entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush audit log");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "Audit log lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, audit log stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "Audit log finished");
    }

    /// Convert an event to an entry, or None if filtered by level.
    fn entry_for(&self, event: &EngineEvent) -> Option<AuditEntry> {
        use serde_json::json;

        let entry = match event {
            // L1: run lifecycle and configuration problems
            EngineEvent::FlowAdmitted { flow_id, version, status } => AuditEntry::new("flow_admitted")
                .flow(flow_id)
                .detail(json!({ "version": version, "status": status })),
            EngineEvent::FlowRetired { flow_id, version } => AuditEntry::new("flow_retired")
                .flow(flow_id)
                .detail(json!({ "version": version })),
            EngineEvent::TriggerFired { flow_id, trigger_id, run_id, cause } => {
                AuditEntry::new("trigger_fired")
                    .flow(flow_id)
                    .run(run_id)
                    .detail(json!({ "trigger": trigger_id, "cause": cause }))
            }
            EngineEvent::RunFinished { run_id, flow_id, status, failure } => {
                AuditEntry::new("run_finished")
                    .flow(flow_id)
                    .run(run_id)
                    .detail(json!({ "status": status, "failure": failure }))
            }
            EngineEvent::RunRecovered { run_id, status } => AuditEntry::new("run_recovered")
                .run(run_id)
                .detail(json!({ "status": status })),
            EngineEvent::ConfigurationError { flow_id, run_id, detail } => {
                let mut e = AuditEntry::new("configuration_error")
                    .flow(flow_id)
                    .detail(json!({ "detail": detail }));
                e.run_id = run_id.as_ref().map(|r| r.to_string());
                e
            }

            // L2: gate decisions, approvals, dropped fires
            EngineEvent::GateDecided { run_id, node_id, decision, confidence, simulated }
                if self.level >= 2 =>
            {
                AuditEntry::new("gate_decided").run(run_id).detail(json!({
                    "node": node_id,
                    "decision": decision,
                    "confidence": confidence,
                    "simulated": simulated,
                }))
            }
            EngineEvent::ApprovalRequested { request } if self.level >= 2 => {
                AuditEntry::new("approval_requested")
                    .flow(&request.flow_id)
                    .run(&request.run_id)
                    .detail(json!({
                        "node": request.node_id,
                        "action": request.action,
                        "confidence": request.confidence,
                        "reason": request.reason,
                    }))
            }
            EngineEvent::ApprovalResolved { run_id, approved } if self.level >= 2 => {
                AuditEntry::new("approval_resolved")
                    .run(run_id)
                    .detail(json!({ "approved": approved }))
            }
            EngineEvent::FireSkipped { flow_id, trigger_id, in_flight } if self.level >= 2 => {
                AuditEntry::new("fire_skipped")
                    .flow(flow_id)
                    .detail(json!({ "trigger": trigger_id, "in_flight": in_flight }))
            }

            // L3: per node and per sample
            EngineEvent::RunStarted { run_id, flow_id } if self.level >= 3 => {
                AuditEntry::new("run_started").flow(flow_id).run(run_id)
            }
            EngineEvent::NodeFinished { run_id, node_id, status, detail } if self.level >= 3 => {
                AuditEntry::new("node_finished").run(run_id).detail(json!({
                    "node": node_id,
                    "status": status,
                    "detail": truncate_str(detail, 500),
                }))
            }
            EngineEvent::FailureOutcomeFired { run_id, node_id } if self.level >= 3 => {
                AuditEntry::new("failure_outcome_fired")
                    .run(run_id)
                    .detail(json!({ "node": node_id }))
            }
            EngineEvent::SampleRejected { source, reason } if self.level >= 3 => {
                AuditEntry::new("sample_rejected").detail(json!({ "source": source, "reason": reason }))
            }

            _ => return None,
        };
        Some(entry)
    }
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripwire_core::types::{FlowId, NodeStatus, RunId, RunStatus};

    fn node_finished() -> EngineEvent {
        EngineEvent::NodeFinished {
            run_id: RunId::from_string("r"),
            node_id: "restart".into(),
            status: NodeStatus::Succeeded,
            detail: "ok".into(),
        }
    }

    fn skipped() -> EngineEvent {
        EngineEvent::FireSkipped {
            flow_id: FlowId::from_string("f"),
            trigger_id: "t".into(),
            in_flight: RunId::from_string("r"),
        }
    }

    #[test]
    fn level_filtering() {
        let finished = EngineEvent::RunFinished {
            run_id: RunId::from_string("r"),
            flow_id: FlowId::from_string("f"),
            status: RunStatus::Completed,
            failure: None,
        };

        let l1 = AuditLog::new(PathBuf::from("/tmp"), 1);
        assert!(l1.entry_for(&finished).is_some());
        assert!(l1.entry_for(&skipped()).is_none());
        assert!(l1.entry_for(&node_finished()).is_none());

        let l2 = AuditLog::new(PathBuf::from("/tmp"), 2);
        assert!(l2.entry_for(&skipped()).is_some());
        assert!(l2.entry_for(&node_finished()).is_none());

        let l3 = AuditLog::new(PathBuf::from("/tmp"), 3);
        assert!(l3.entry_for(&node_finished()).is_some());
    }

    #[test]
    fn entry_omits_empty_fields() {
        let entry = AuditLog::new(PathBuf::from("/tmp"), 3)
            .entry_for(&EngineEvent::SampleRejected {
                source: "probe".into(),
                reason: "no usable metric".into(),
            })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"sample_rejected\""));
        assert!(!json.contains("run_id"));
        assert!(!json.contains("flow_id"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("abc", 10), "abc");
    }

    #[tokio::test]
    async fn writes_jsonl_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            AuditLog::new(dir.path().to_path_buf(), 3).run(bus.clone(), cancel.clone()),
        );

        // Give the task a moment to subscribe.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        bus.publish(node_finished());
        bus.publish(skipped());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let file = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(file).unwrap();
        let types: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event_type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["node_finished", "fire_skipped"]);
    }
}
