use thiserror::Error;

#[derive(Debug, Error)]
pub enum TripwireError {
    // Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Flow rejected with {} validation error(s): {}", .0.len(), join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("Flow {flow} version {version} already exists with a different definition")]
    VersionConflict { flow: String, version: u64 },

    #[error("Flow {flow} version {version} is older than the latest known version {latest}")]
    StaleVersion { flow: String, version: u64, latest: u64 },

    // Lookup errors
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Trigger {trigger} not found in flow {flow}")]
    TriggerNotFound { flow: String, trigger: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Flow {0} is not active")]
    FlowInactive(String),

    // Action errors
    #[error("No executor registered for action kind: {0}")]
    ExecutorNotFound(String),

    #[error("Action execution failed: {action}: {message}")]
    ActionExecution { action: String, message: String },

    #[error("Action timeout after {timeout_secs}s: {action}")]
    ActionTimeout { action: String, timeout_secs: u64 },

    // Approval errors
    #[error("Run {0} is not awaiting approval")]
    NotAwaitingApproval(String),

    #[error("Run {0} is not cancellable in its current state")]
    NotCancellable(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run {0} was already recorded")]
    DuplicateRun(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TripwireError>;

/// A single structural problem found while validating a flow graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("flow has no trigger node")]
    MissingTrigger,

    #[error("flow has no outcome node")]
    MissingOutcome,

    #[error("cycle among action/outcome nodes: {}", .nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("action '{0}' is not reachable from any trigger")]
    UnreachableAction(String),

    #[error("schedule trigger '{node}' has invalid cron expression '{expr}': {reason}")]
    InvalidSchedule {
        node: String,
        expr: String,
        reason: String,
    },

    #[error("invalid gate policy: {0}")]
    InvalidPolicy(String),

    #[error("edge {from} -> {to} carries a guard but '{from}' is not a conditional outcome")]
    UnexpectedGuard { from: String, to: String },

    #[error("conditional outcome '{0}' has no outgoing edges")]
    DeadEndConditional(String),

    #[error("node '{node}' has an invalid payload: {reason}")]
    InvalidPayload { node: String, reason: String },
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_violation() {
        let err = TripwireError::Validation(vec![
            ValidationError::MissingTrigger,
            ValidationError::DuplicateNodeId("a".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 validation error(s)"));
        assert!(msg.contains("no trigger"));
        assert!(msg.contains("duplicate node id 'a'"));
    }

    #[test]
    fn cycle_lists_nodes() {
        let err = ValidationError::Cycle {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "cycle among action/outcome nodes: a, b");
    }
}
