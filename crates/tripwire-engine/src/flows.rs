use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use tripwire_core::error::{Result, TripwireError};
use tripwire_core::types::{FlowId, FlowStatus};

use crate::graph::ValidGraph;

/// One admitted flow version.
#[derive(Debug, Clone)]
pub struct FlowVersion {
    pub graph: Arc<ValidGraph>,
    pub status: FlowStatus,
}

/// Listing entry for a flow id.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub id: FlowId,
    pub name: String,
    pub latest_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_version: Option<u64>,
    pub versions: Vec<(u64, FlowStatus)>,
}

/// What an admission changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub flow_id: FlowId,
    pub version: u64,
    pub status: FlowStatus,
    /// Previously active version that was deactivated by this admission.
    pub deactivated: Option<u64>,
}

/// The admitted set of validated flow versions.
///
/// Versions never go backwards, an `(id, version)` with run history is
/// immutable, and at most one version per flow is active.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: HashMap<FlowId, BTreeMap<u64, FlowVersion>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a validated graph with the status it carries.
    pub fn admit(&mut self, graph: ValidGraph, has_history: bool) -> Result<Admission> {
        let flow_id = graph.id().clone();
        let version = graph.version();
        let status = graph.flow().status;
        let versions = self.flows.entry(flow_id.clone()).or_default();

        if let Some(existing) = versions.get(&version) {
            if !existing.graph.flow().same_structure(graph.flow()) && has_history {
                return Err(TripwireError::VersionConflict {
                    flow: flow_id.to_string(),
                    version,
                });
            }
        } else if let Some((&latest, _)) = versions.last_key_value() {
            if version < latest {
                return Err(TripwireError::StaleVersion {
                    flow: flow_id.to_string(),
                    version,
                    latest,
                });
            }
        }

        let mut deactivated = None;
        if status == FlowStatus::Active {
            for (v, entry) in versions.iter_mut() {
                if *v != version && entry.status == FlowStatus::Active {
                    entry.status = FlowStatus::Inactive;
                    deactivated = Some(*v);
                }
            }
        }

        versions.insert(
            version,
            FlowVersion {
                graph: Arc::new(graph),
                status,
            },
        );

        Ok(Admission {
            flow_id,
            version,
            status,
            deactivated,
        })
    }

    /// Deactivate the active version of a flow. Returns the retired version.
    pub fn retire(&mut self, flow_id: &FlowId) -> Result<u64> {
        let versions = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| TripwireError::FlowNotFound(flow_id.to_string()))?;
        let (version, entry) = versions
            .iter_mut()
            .find(|(_, e)| e.status == FlowStatus::Active)
            .ok_or_else(|| TripwireError::FlowInactive(flow_id.to_string()))?;
        entry.status = FlowStatus::Inactive;
        Ok(*version)
    }

    /// The active version of a flow.
    pub fn active(&self, flow_id: &FlowId) -> Result<Arc<ValidGraph>> {
        let versions = self
            .flows
            .get(flow_id)
            .ok_or_else(|| TripwireError::FlowNotFound(flow_id.to_string()))?;
        versions
            .values()
            .find(|e| e.status == FlowStatus::Active)
            .map(|e| e.graph.clone())
            .ok_or_else(|| TripwireError::FlowInactive(flow_id.to_string()))
    }

    /// A specific version, whatever its status.
    pub fn get(&self, flow_id: &FlowId, version: u64) -> Option<Arc<ValidGraph>> {
        self.flows
            .get(flow_id)?
            .get(&version)
            .map(|e| e.graph.clone())
    }

    pub fn status(&self, flow_id: &FlowId, version: u64) -> Option<FlowStatus> {
        self.flows.get(flow_id)?.get(&version).map(|e| e.status)
    }

    /// Every active graph, ordered by flow id.
    pub fn active_graphs(&self) -> Vec<Arc<ValidGraph>> {
        let mut out: Vec<_> = self
            .flows
            .values()
            .flat_map(|versions| versions.values())
            .filter(|e| e.status == FlowStatus::Active)
            .map(|e| e.graph.clone())
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    pub fn summaries(&self) -> Vec<FlowSummary> {
        let mut out: Vec<FlowSummary> = self
            .flows
            .iter()
            .filter_map(|(id, versions)| {
                let (&latest_version, latest) = versions.last_key_value()?;
                Some(FlowSummary {
                    id: id.clone(),
                    name: latest.graph.flow().name.clone(),
                    latest_version,
                    active_version: versions
                        .iter()
                        .find(|(_, e)| e.status == FlowStatus::Active)
                        .map(|(v, _)| *v),
                    versions: versions.iter().map(|(v, e)| (*v, e.status)).collect(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripwire_core::action::ActionSpec;

    use crate::graph::{validate, Edge, FlowGraph, Node, OutcomeKind, TriggerSpec};

    fn flow(version: u64, status: FlowStatus, service: &str) -> ValidGraph {
        let mut f = FlowGraph::new("failover", "Failover")
            .with_node(Node::trigger("manual", TriggerSpec::Manual))
            .with_node(Node::action(
                "restart",
                ActionSpec::RestartService {
                    service: service.into(),
                    region: None,
                },
            ))
            .with_node(Node::outcome("done", OutcomeKind::Success))
            .with_edge(Edge::new("manual", "restart"))
            .with_edge(Edge::new("restart", "done"))
            .with_status(status);
        f.version = version;
        validate(&f).unwrap()
    }

    #[test]
    fn activating_a_version_deactivates_the_previous() {
        let mut reg = FlowRegistry::new();
        reg.admit(flow(1, FlowStatus::Active, "api"), false).unwrap();
        let adm = reg.admit(flow(2, FlowStatus::Active, "web"), false).unwrap();
        assert_eq!(adm.deactivated, Some(1));

        let id = FlowId::from_string("failover");
        assert_eq!(reg.active(&id).unwrap().version(), 2);
        assert_eq!(reg.status(&id, 1), Some(FlowStatus::Inactive));
        assert!(reg.get(&id, 1).is_some());
        assert_eq!(reg.active_graphs().len(), 1);
    }

    #[test]
    fn stale_and_conflicting_versions_are_rejected() {
        let mut reg = FlowRegistry::new();
        reg.admit(flow(3, FlowStatus::Active, "api"), false).unwrap();

        let err = reg.admit(flow(2, FlowStatus::Active, "api"), false).unwrap_err();
        assert!(matches!(err, TripwireError::StaleVersion { latest: 3, .. }));

        // Same structure is an idempotent resubmission.
        reg.admit(flow(3, FlowStatus::Active, "api"), true).unwrap();

        let err = reg.admit(flow(3, FlowStatus::Active, "web"), true).unwrap_err();
        assert!(matches!(err, TripwireError::VersionConflict { version: 3, .. }));

        // Without history the version may still be replaced.
        reg.admit(flow(3, FlowStatus::Draft, "web"), false).unwrap();
        let id = FlowId::from_string("failover");
        assert_eq!(reg.status(&id, 3), Some(FlowStatus::Draft));
    }

    #[test]
    fn retire_and_lookup_errors() {
        let mut reg = FlowRegistry::new();
        let id = FlowId::from_string("failover");
        assert!(matches!(reg.retire(&id), Err(TripwireError::FlowNotFound(_))));

        reg.admit(flow(1, FlowStatus::Active, "api"), false).unwrap();
        assert_eq!(reg.retire(&id).unwrap(), 1);
        assert!(matches!(reg.retire(&id), Err(TripwireError::FlowInactive(_))));
        assert!(matches!(reg.active(&id), Err(TripwireError::FlowInactive(_))));

        let summary = &reg.summaries()[0];
        assert_eq!(summary.latest_version, 1);
        assert_eq!(summary.active_version, None);
        assert_eq!(summary.versions, vec![(1, FlowStatus::Inactive)]);
    }
}
