use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tripwire_core::types::{NodeResult, NodeStatus};

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Guard predicate. Only valid on edges leaving a conditional outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
}

/// Predicate over the action results accumulated so far in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Guard {
    /// A node's latest result has the given status.
    Status { node: String, is: NodeStatus },
    /// Simple expression over `<node>_status` and `<node>_detail` keys.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Expr { expr: String },
    All { of: Vec<Guard> },
    Any { of: Vec<Guard> },
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    pub fn guarded(from: impl Into<String>, to: impl Into<String>, guard: Guard) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Some(guard),
        }
    }
}

impl Guard {
    pub fn status(node: impl Into<String>, is: NodeStatus) -> Self {
        Self::Status {
            node: node.into(),
            is,
        }
    }

    pub fn expr(expr: impl Into<String>) -> Self {
        Self::Expr { expr: expr.into() }
    }

    /// Evaluate against the run's node results. Unknown nodes never match.
    pub fn matches(&self, results: &[NodeResult]) -> bool {
        match self {
            Self::Status { node, is } => results
                .iter()
                .rev()
                .find(|r| &r.node_id == node)
                .is_some_and(|r| r.status == *is),
            Self::Expr { expr } => evaluate_expr(expr, &guard_context(results)),
            Self::All { of } => of.iter().all(|g| g.matches(results)),
            Self::Any { of } => of.iter().any(|g| g.matches(results)),
        }
    }

    /// Node ids this guard refers to.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        match self {
            Self::Status { node, .. } => vec![node.as_str()],
            Self::Expr { .. } => vec![],
            Self::All { of } | Self::Any { of } => {
                of.iter().flat_map(|g| g.referenced_nodes()).collect()
            }
        }
    }
}

/// Expression context: `<node>_status` and `<node>_detail` for every result.
fn guard_context(results: &[NodeResult]) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    for r in results {
        ctx.insert(format!("{}_status", r.node_id), r.status.to_string());
        ctx.insert(format!("{}_detail", r.node_id), r.detail.clone());
    }
    ctx
}

/// Evaluate a simple expression. Returns `false` for unparseable expressions.
pub fn evaluate_expr(expr: &str, context: &HashMap<String, String>) -> bool {
    let Some((key, op, value)) = parse_expr(expr) else {
        return false;
    };
    let Some(actual) = context.get(key) else {
        return false;
    };
    match op {
        Op::Contains => actual.contains(value),
        Op::Ne => actual != value,
        Op::Eq => actual == value,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Contains,
}

/// Parse `key OP "value"`, taking the first operator left of any quote.
/// `contains` only counts as a whitespace-delimited word.
fn parse_expr(expr: &str) -> Option<(&str, Op, &str)> {
    let expr = expr.trim();
    let head = &expr[..expr.find('"').unwrap_or(expr.len())];
    let (pos, len, op) = [("==", Op::Eq), ("!=", Op::Ne), (" contains ", Op::Contains)]
        .into_iter()
        .filter_map(|(token, op)| head.find(token).map(|pos| (pos, token.len(), op)))
        .min_by_key(|(pos, _, _)| *pos)?;
    let key = expr[..pos].trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, op, expr[pos + len..].trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tripwire_core::action::ActionKind;

    fn result(node: &str, status: NodeStatus, detail: &str) -> NodeResult {
        NodeResult {
            node_id: node.into(),
            action: ActionKind::Script,
            status,
            detail: detail.into(),
            confidence: None,
            gate: None,
            simulated: false,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn status_guard_uses_latest_result() {
        let results = vec![
            result("probe", NodeStatus::Failed, "first"),
            result("probe", NodeStatus::Succeeded, "retry"),
        ];
        assert!(Guard::status("probe", NodeStatus::Succeeded).matches(&results));
        assert!(!Guard::status("probe", NodeStatus::Failed).matches(&results));
        assert!(!Guard::status("other", NodeStatus::Succeeded).matches(&results));
    }

    #[test]
    fn expr_guard_over_status_and_detail() {
        let results = vec![result("check", NodeStatus::Succeeded, "region eu-central-1 healthy")];
        assert!(Guard::expr(r#"check_status == "succeeded""#).matches(&results));
        assert!(Guard::expr(r#"check_detail contains "healthy""#).matches(&results));
        assert!(Guard::expr(r#"check_status != "failed""#).matches(&results));
        assert!(!Guard::expr(r#"missing_status == "succeeded""#).matches(&results));
        assert!(!Guard::expr("not an expression").matches(&results));
    }

    #[test]
    fn expr_operators_inside_values_and_ids() {
        let results = vec![
            result("check", NodeStatus::Succeeded, "contains foo"),
            result("contains_probe", NodeStatus::Failed, "a == b"),
        ];
        assert!(Guard::expr(r#"check_detail == "contains foo""#).matches(&results));
        assert!(!Guard::expr(r#"check_detail == "contains bar""#).matches(&results));
        assert!(Guard::expr(r#"contains_probe_status == "failed""#).matches(&results));
        assert!(Guard::expr(r#"contains_probe_detail contains "==""#).matches(&results));
        assert!(Guard::expr(r#"contains_probe_detail != "contains""#).matches(&results));
        assert!(Guard::expr("check_status==succeeded").matches(&results));
    }

    #[test]
    fn combinators() {
        let results = vec![
            result("a", NodeStatus::Succeeded, ""),
            result("b", NodeStatus::Failed, ""),
        ];
        let all = Guard::All {
            of: vec![
                Guard::status("a", NodeStatus::Succeeded),
                Guard::status("b", NodeStatus::Failed),
            ],
        };
        assert!(all.matches(&results));
        let any = Guard::Any {
            of: vec![
                Guard::status("a", NodeStatus::Failed),
                Guard::status("b", NodeStatus::Succeeded),
            ],
        };
        assert!(!any.matches(&results));
        assert_eq!(all.referenced_nodes(), vec!["a", "b"]);
    }

    #[test]
    fn guard_serde_shape() {
        let edge = Edge::guarded("cond", "ok", Guard::status("restart", NodeStatus::Succeeded));
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["guard"]["type"], "status");
        assert_eq!(json["guard"]["is"], "succeeded");
        let plain = serde_json::to_value(Edge::new("a", "b")).unwrap();
        assert!(plain.get("guard").is_none());
    }
}
