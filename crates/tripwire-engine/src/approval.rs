use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use tripwire_core::event::EventBus;
use tripwire_core::types::{ApprovalDecision, ApprovalRequest, EngineEvent, RunId};

/// Pending approvals for suspended runs, keyed by run.
///
/// A suspended run holds no task; resolving a request hands it back to the
/// caller, which resumes the run from its checkpoint.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<RunId, ApprovalRequest>>,
    event_bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Queue a request and publish it.
    pub async fn request(&self, req: ApprovalRequest) {
        self.event_bus.publish(EngineEvent::ApprovalRequested {
            request: req.clone(),
        });
        self.pending.lock().await.insert(req.run_id.clone(), req);
    }

    /// Re-queue a request found in a checkpoint at recovery. Does not publish.
    pub async fn restore(&self, req: ApprovalRequest) {
        self.pending.lock().await.insert(req.run_id.clone(), req);
    }

    /// Resolve a pending request. Returns the request if it was pending.
    pub async fn respond(&self, run_id: &RunId, decision: &ApprovalDecision) -> Option<ApprovalRequest> {
        let req = self.pending.lock().await.remove(run_id)?;
        self.event_bus.publish(EngineEvent::ApprovalResolved {
            run_id: run_id.clone(),
            approved: matches!(decision, ApprovalDecision::Approved),
        });
        Some(req)
    }

    /// Drop a request without resolving it (run cancelled).
    pub async fn withdraw(&self, run_id: &RunId) -> Option<ApprovalRequest> {
        self.pending.lock().await.remove(run_id)
    }

    pub async fn is_pending(&self, run_id: &RunId) -> bool {
        self.pending.lock().await.contains_key(run_id)
    }

    /// All pending approvals, oldest first.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut out: Vec<_> = self.pending.lock().await.values().cloned().collect();
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        out
    }

    /// Runs whose approval window closed before `now`.
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<RunId> {
        self.pending
            .lock()
            .await
            .values()
            .filter(|r| r.expires_at.is_some_and(|t| t <= now))
            .map(|r| r.run_id.clone())
            .collect()
    }

    /// Earliest expiry among pending requests.
    pub async fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.pending
            .lock()
            .await
            .values()
            .filter_map(|r| r.expires_at)
            .min()
    }

    /// Resolve a run id given by an operator: an exact pending id wins,
    /// otherwise a unique prefix.
    pub async fn resolve(&self, id: &str) -> Option<RunId> {
        let exact = RunId::from_string(id);
        if self.is_pending(&exact).await {
            return Some(exact);
        }
        self.find_by_prefix(id).await
    }

    /// Find a pending run by prefix match on the run id.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<RunId> {
        let pending = self.pending.lock().await;
        let mut matches = pending.keys().filter(|k| k.as_str().starts_with(prefix));
        let first = matches.next()?.clone();
        // Ambiguous prefixes resolve to nothing.
        match matches.next() {
            Some(_) => None,
            None => Some(first),
        }
    }
}
