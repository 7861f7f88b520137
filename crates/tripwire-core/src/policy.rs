use std::fmt;

use serde::{Deserialize, Serialize};

/// Decision from the decision gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    AutoExecute,
    QueueForApproval,
    Reject,
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoExecute => write!(f, "auto_execute"),
            Self::QueueForApproval => write!(f, "queue_for_approval"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Priority assigned by a traffic match rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulePriority {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for RulePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for RulePriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Source/destination match rule. Both patterns are regexes; an absent
/// pattern matches anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityRule {
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub priority: RulePriority,
}

/// Traffic an action affects, matched against priority rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSelector {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

/// Confidence gating policy. Immutable once a run has taken a snapshot of it;
/// changes produce a new `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(default = "default_revision")]
    pub revision: u64,

    /// Below this confidence an action is rejected outright.
    #[serde(default = "default_minimum_confidence")]
    pub minimum_confidence_required: u8,

    /// At or above this confidence an action may auto-execute.
    #[serde(default = "default_confidence_level")]
    pub confidence_level: u8,

    #[serde(default)]
    pub require_admin_approval: bool,

    #[serde(default)]
    pub simulation_mode_enabled: bool,

    /// Blend historical action success rate into confidence.
    #[serde(default)]
    pub adaptive_learning: bool,

    /// Weight of the historical success rate (0.0 to 1.0).
    #[serde(default = "default_learning_weight")]
    pub learning_weight: f64,

    /// Executions of an action kind needed before history counts.
    #[serde(default = "default_min_history")]
    pub min_history: u32,

    /// Confidence for schedule/event triggers that carry no breach data.
    #[serde(default = "default_baseline_confidence")]
    pub baseline_confidence: u8,

    /// Points removed from the auto-execute bar for high-priority matches.
    #[serde(default = "default_high_priority_discount")]
    pub high_priority_discount: u8,

    #[serde(default)]
    pub priority_rules: Vec<PriorityRule>,

    /// Pending approvals older than this are cancelled. None = wait forever.
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,
}

fn default_revision() -> u64 { 1 }
fn default_minimum_confidence() -> u8 { 60 }
fn default_confidence_level() -> u8 { 85 }
fn default_learning_weight() -> f64 { 0.3 }
fn default_min_history() -> u32 { 5 }
fn default_baseline_confidence() -> u8 { 75 }
fn default_high_priority_discount() -> u8 { 10 }

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            revision: default_revision(),
            minimum_confidence_required: default_minimum_confidence(),
            confidence_level: default_confidence_level(),
            require_admin_approval: false,
            simulation_mode_enabled: false,
            adaptive_learning: false,
            learning_weight: default_learning_weight(),
            min_history: default_min_history(),
            baseline_confidence: default_baseline_confidence(),
            high_priority_discount: default_high_priority_discount(),
            priority_rules: vec![],
            approval_timeout_secs: None,
        }
    }
}

impl GatePolicy {
    /// Check internal consistency. Returns every problem found.
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, value) in [
            ("minimum_confidence_required", self.minimum_confidence_required),
            ("confidence_level", self.confidence_level),
            ("baseline_confidence", self.baseline_confidence),
        ] {
            if value > 100 {
                problems.push(format!("{} must be 0-100, got {}", name, value));
            }
        }
        if self.minimum_confidence_required > self.confidence_level {
            problems.push(format!(
                "minimum_confidence_required ({}) exceeds confidence_level ({})",
                self.minimum_confidence_required, self.confidence_level
            ));
        }
        if !(0.0..=1.0).contains(&self.learning_weight) {
            problems.push(format!(
                "learning_weight must be within 0.0-1.0, got {}",
                self.learning_weight
            ));
        }
        for rule in &self.priority_rules {
            for pattern in [&rule.source, &rule.destination].into_iter().flatten() {
                if let Err(e) = regex::Regex::new(pattern) {
                    problems.push(format!("rule '{}' has invalid pattern '{}': {}", rule.name, pattern, e));
                }
            }
        }
        problems
    }

    /// Auto-execute bar after applying the priority discount. Never drops
    /// below the minimum.
    pub fn effective_bar(&self, priority: RulePriority) -> u8 {
        let bar = self.confidence_level;
        if priority == RulePriority::High {
            bar.saturating_sub(self.high_priority_discount)
                .max(self.minimum_confidence_required)
        } else {
            bar
        }
    }

    /// Decide what to do for a confidence score and matched priority.
    /// Both the minimum and the auto-execute bar are inclusive.
    pub fn decide(&self, confidence: u8, priority: RulePriority) -> GateDecision {
        if confidence < self.minimum_confidence_required {
            return GateDecision::Reject;
        }
        if self.require_admin_approval {
            return GateDecision::QueueForApproval;
        }
        if confidence < self.effective_bar(priority) {
            return GateDecision::QueueForApproval;
        }
        GateDecision::AutoExecute
    }
}

/// Compiled regex cache for priority rules.
pub struct PriorityMatcher {
    rules: Vec<(Option<regex::Regex>, Option<regex::Regex>, RulePriority, String)>,
}

impl PriorityMatcher {
    /// Compile rules. Invalid patterns drop the rule with a warning.
    pub fn new(rules: &[PriorityRule]) -> Self {
        let compile = |p: &Option<String>| -> Result<Option<regex::Regex>, regex::Error> {
            p.as_deref().map(regex::Regex::new).transpose()
        };
        let compiled = rules
            .iter()
            .filter_map(|r| match (compile(&r.source), compile(&r.destination)) {
                (Ok(src), Ok(dst)) => Some((src, dst, r.priority, r.name.clone())),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(rule = %r.name, error = %e, "Invalid priority rule pattern, skipping");
                    None
                }
            })
            .collect();
        Self { rules: compiled }
    }

    /// Highest priority among matching rules, with the rule name.
    /// Unmatched traffic is `Medium`.
    pub fn priority_for(&self, traffic: Option<&TrafficSelector>) -> (RulePriority, Option<&str>) {
        let Some(traffic) = traffic else {
            return (RulePriority::Medium, None);
        };
        let field_matches = |re: &Option<regex::Regex>, value: &Option<String>| match re {
            None => true,
            Some(re) => value.as_deref().is_some_and(|v| re.is_match(v)),
        };
        self.rules
            .iter()
            .filter(|(src, dst, _, _)| {
                field_matches(src, &traffic.source) && field_matches(dst, &traffic.destination)
            })
            .max_by_key(|(_, _, p, _)| *p)
            .map(|(_, _, p, name)| (*p, Some(name.as_str())))
            .unwrap_or((RulePriority::Medium, None))
    }
}
