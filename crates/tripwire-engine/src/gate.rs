use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tripwire_core::action::ActionKind;
use tripwire_core::error::Result;
use tripwire_core::policy::{GateDecision, GatePolicy, PriorityMatcher, RulePriority};
use tripwire_core::traits::RunStore;

use crate::condition::TriggerDecision;
use crate::graph::{ActionNode, TriggerSpec};

/// What the severity part of a confidence score is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfidenceBasis {
    /// A condition breach with this worst relative excess.
    Breach { excess: f64 },
    /// An operator asked for the run.
    Manual,
    /// Schedule or event trigger; no breach data.
    Baseline,
}

impl ConfidenceBasis {
    pub fn for_trigger(trigger: &TriggerSpec, decision: Option<&TriggerDecision>) -> Self {
        match trigger {
            TriggerSpec::Manual => Self::Manual,
            TriggerSpec::Condition { .. } => match decision.and_then(|d| d.worst.as_ref()) {
                Some(worst) => Self::Breach {
                    excess: worst.relative_excess(),
                },
                None => Self::Baseline,
            },
            TriggerSpec::Schedule { .. } | TriggerSpec::Event { .. } => Self::Baseline,
        }
    }
}

/// The gate's answer for one candidate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// What the executor should do.
    pub decision: GateDecision,
    /// What a live run would have done. Differs from `decision` only in
    /// simulation mode.
    pub live_decision: GateDecision,
    pub confidence: u8,
    pub severity: u8,
    /// Historical success rate, when adaptive learning applied.
    #[serde(default)]
    pub success_rate: Option<f64>,
    pub priority: RulePriority,
    #[serde(default)]
    pub rule: Option<String>,
    /// Auto-execute bar after the priority discount.
    pub bar: u8,
    pub minimum: u8,
    pub simulated: bool,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.simulated {
            write!(f, "simulated: live gate would {}", self.live_decision)?;
        } else {
            write!(f, "gate: {}", self.decision)?;
        }
        write!(
            f,
            " (confidence {}, minimum {}, bar {}, priority {}",
            self.confidence, self.minimum, self.bar, self.priority
        )?;
        if let Some(rule) = &self.rule {
            write!(f, " via rule '{}'", rule)?;
        }
        if let Some(rate) = self.success_rate {
            write!(f, ", history {:.0}%", rate * 100.0)?;
        }
        write!(f, ")")
    }
}

/// DecisionGate: scores candidate actions and decides whether they may run.
pub struct DecisionGate {
    policy: Arc<GatePolicy>,
    matcher: PriorityMatcher,
    store: Arc<dyn RunStore>,
}

impl DecisionGate {
    pub fn new(policy: Arc<GatePolicy>, store: Arc<dyn RunStore>) -> Self {
        let matcher = PriorityMatcher::new(&policy.priority_rules);
        Self {
            policy,
            matcher,
            store,
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Severity score 0-100 for a basis.
    pub fn severity(&self, basis: &ConfidenceBasis) -> f64 {
        match basis {
            ConfidenceBasis::Breach { excess } => 50.0 + 50.0 * excess.clamp(0.0, 1.0),
            ConfidenceBasis::Manual => 100.0,
            ConfidenceBasis::Baseline => self.policy.baseline_confidence as f64,
        }
    }

    /// Historical success rate for an action kind, once enough runs exist.
    async fn success_rate(&self, kind: ActionKind) -> Result<Option<f64>> {
        if !self.policy.adaptive_learning {
            return Ok(None);
        }
        let (succeeded, failed) = self.store.action_stats(kind, None).await?;
        let total = succeeded + failed;
        if total == 0 || total < self.policy.min_history as u64 {
            debug!(action = %kind, total, "Not enough history for adaptive confidence");
            return Ok(None);
        }
        Ok(Some(succeeded as f64 / total as f64))
    }

    /// Score and decide for one action.
    pub async fn evaluate(&self, action: &ActionNode, basis: &ConfidenceBasis) -> Result<Verdict> {
        let severity = self.severity(basis);
        let success_rate = self.success_rate(action.action.kind()).await?;
        let score = match success_rate {
            Some(rate) => {
                let w = self.policy.learning_weight;
                (1.0 - w) * severity + w * 100.0 * rate
            }
            None => severity,
        };
        let confidence = score.round().clamp(0.0, 100.0) as u8;

        let (priority, rule) = self.matcher.priority_for(action.traffic.as_ref());
        let live_decision = self.policy.decide(confidence, priority);
        let simulated = self.policy.simulation_mode_enabled;
        let decision = if simulated {
            GateDecision::AutoExecute
        } else {
            live_decision
        };

        Ok(Verdict {
            decision,
            live_decision,
            confidence,
            severity: severity.round().clamp(0.0, 100.0) as u8,
            success_rate,
            priority,
            rule: rule.map(str::to_string),
            bar: self.policy.effective_bar(priority),
            minimum: self.policy.minimum_confidence_required,
            simulated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteRunStore;
    use chrono::Utc;
    use tripwire_core::action::ActionSpec;
    use tripwire_core::policy::{PriorityRule, TrafficSelector};
    use tripwire_core::types::{FlowId, NodeResult, NodeStatus, RunRecord, RunStatus};

    fn restart() -> ActionNode {
        ActionNode {
            action: ActionSpec::RestartService {
                service: "api".into(),
                region: None,
            },
            timeout_secs: None,
            traffic: None,
        }
    }

    fn gate(policy: GatePolicy) -> DecisionGate {
        let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::in_memory().unwrap());
        DecisionGate::new(Arc::new(policy), store)
    }

    #[tokio::test]
    async fn breach_severity_scales_with_excess() {
        let g = gate(GatePolicy::default());
        let v = g.evaluate(&restart(), &ConfidenceBasis::Breach { excess: 0.5 }).await.unwrap();
        assert_eq!(v.confidence, 75);
        assert_eq!(v.decision, GateDecision::QueueForApproval);

        let v = g.evaluate(&restart(), &ConfidenceBasis::Breach { excess: 4.0 }).await.unwrap();
        assert_eq!(v.confidence, 100);
        assert_eq!(v.decision, GateDecision::AutoExecute);

        let v = g.evaluate(&restart(), &ConfidenceBasis::Breach { excess: 0.1 }).await.unwrap();
        assert_eq!(v.confidence, 55);
        assert_eq!(v.decision, GateDecision::Reject);
    }

    #[tokio::test]
    async fn manual_and_baseline() {
        let g = gate(GatePolicy {
            baseline_confidence: 70,
            ..Default::default()
        });
        let v = g.evaluate(&restart(), &ConfidenceBasis::Manual).await.unwrap();
        assert_eq!(v.confidence, 100);
        let v = g.evaluate(&restart(), &ConfidenceBasis::Baseline).await.unwrap();
        assert_eq!(v.confidence, 70);
        assert_eq!(v.decision, GateDecision::QueueForApproval);
    }

    #[tokio::test]
    async fn confidence_at_the_bar_auto_executes() {
        let g = gate(GatePolicy {
            confidence_level: 100,
            ..Default::default()
        });
        let v = g.evaluate(&restart(), &ConfidenceBasis::Manual).await.unwrap();
        assert_eq!(v.confidence, 100);
        assert_eq!(v.decision, GateDecision::AutoExecute);

        let g = gate(GatePolicy::default());
        // 50 + 50 * 0.7 = 85, exactly the default bar.
        let v = g.evaluate(&restart(), &ConfidenceBasis::Breach { excess: 0.7 }).await.unwrap();
        assert_eq!(v.confidence, 85);
        assert_eq!(v.decision, GateDecision::AutoExecute);
    }

    #[tokio::test]
    async fn simulation_always_auto_executes_but_keeps_live_decision() {
        let g = gate(GatePolicy {
            simulation_mode_enabled: true,
            ..Default::default()
        });
        let v = g.evaluate(&restart(), &ConfidenceBasis::Breach { excess: 0.0 }).await.unwrap();
        assert_eq!(v.decision, GateDecision::AutoExecute);
        assert_eq!(v.live_decision, GateDecision::Reject);
        assert!(v.to_string().starts_with("simulated: live gate would reject"));
    }

    #[tokio::test]
    async fn high_priority_rule_lowers_bar() {
        let g = gate(GatePolicy {
            priority_rules: vec![PriorityRule {
                name: "core".into(),
                source: None,
                destination: Some("^eu-".into()),
                priority: RulePriority::High,
            }],
            ..Default::default()
        });
        let mut action = restart();
        action.traffic = Some(TrafficSelector {
            source: None,
            destination: Some("eu-west-1".into()),
        });
        // 80 is below the normal bar (85) but above the discounted one (75).
        let v = g.evaluate(&action, &ConfidenceBasis::Breach { excess: 0.6 }).await.unwrap();
        assert_eq!(v.confidence, 80);
        assert_eq!(v.bar, 75);
        assert_eq!(v.decision, GateDecision::AutoExecute);
        assert_eq!(v.rule.as_deref(), Some("core"));
    }

    #[tokio::test]
    async fn adaptive_learning_blends_history() {
        let store = Arc::new(SqliteRunStore::in_memory().unwrap());
        for i in 0..4 {
            let mut rec = RunRecord::new(FlowId::from_string("f"), 1, "t", false);
            rec.node_results.push(NodeResult {
                node_id: "a".into(),
                action: ActionKind::RestartService,
                status: if i == 0 { NodeStatus::Failed } else { NodeStatus::Succeeded },
                detail: String::new(),
                confidence: None,
                gate: None,
                simulated: false,
                finished_at: Utc::now(),
            });
            rec.finish(RunStatus::Completed, None);
            store.append(&rec).await.unwrap();
        }
        let policy = GatePolicy {
            adaptive_learning: true,
            learning_weight: 0.5,
            min_history: 4,
            ..Default::default()
        };
        let g = DecisionGate::new(Arc::new(policy.clone()), store.clone());
        // severity 50, success rate 0.75: 0.5*50 + 0.5*75 = 62.5 -> 63
        let v = g.evaluate(&restart(), &ConfidenceBasis::Breach { excess: 0.0 }).await.unwrap();
        assert_eq!(v.confidence, 63);
        assert_eq!(v.success_rate, Some(0.75));

        let g = DecisionGate::new(
            Arc::new(GatePolicy {
                min_history: 5,
                ..policy
            }),
            store,
        );
        let v = g.evaluate(&restart(), &ConfidenceBasis::Breach { excess: 0.0 }).await.unwrap();
        assert_eq!(v.confidence, 50);
        assert!(v.success_rate.is_none());
    }
}
