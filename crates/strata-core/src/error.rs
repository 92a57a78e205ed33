use thiserror::Error;

/// Plan and graph validation failures. Nothing is persisted when one of these
/// is returned from the builder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Plan contains no steps")]
    EmptyPlan,

    #[error("Plan step {index} is invalid: {reason}")]
    InvalidStep { index: usize, reason: String },

    #[error("Node {node} depends on unknown node {dependency}")]
    InvalidDependency { node: String, dependency: String },

    #[error("Cycle detected among nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),
}

/// State machine failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Illegal transition for {entity} {id}: {from} -> {to}")]
    IllegalTransition {
        entity: String,
        id: String,
        from: String,
        to: String,
    },

    #[error("Guard rejected {entity} {id} ({from} -> {to}): {reason}")]
    GuardFailed {
        entity: String,
        id: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("Concurrent update on {entity} {id}: expected {expected}, found {found}")]
    Conflict {
        entity: String,
        id: String,
        expected: String,
        found: String,
    },

    #[error("Transition listener vetoed {entity} {id}: {reason}")]
    Vetoed {
        entity: String,
        id: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum StrataError {
    // Graph errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // Lifecycle errors
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    // Execution errors
    #[error("Node execution failed: {node_id}: {message}")]
    Execution { node_id: String, message: String },

    #[error("Node timeout after {timeout_secs}s: {node_id}")]
    NodeTimeout { node_id: String, timeout_secs: u64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run {run_id} cannot be executed from status {status}")]
    NotExecutable { run_id: String, status: String },

    // Approval errors
    #[error("Approval timeout after {timeout_secs}s: {request_id}")]
    ApprovalTimeout { request_id: String, timeout_secs: u64 },

    #[error("Approval request already resolved: {0}")]
    ApprovalAlreadyResolved(String),

    #[error("Invalid approval resolution: {0}")]
    InvalidResolution(String),

    // Lookup errors
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrataError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn execution(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Whether this is a compare-and-set conflict from a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StateMachine(StateMachineError::Conflict { .. }))
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_nodes() {
        let err: StrataError = ValidationError::CycleDetected {
            nodes: vec!["a".into(), "b".into()],
        }
        .into();
        assert_eq!(err.to_string(), "Cycle detected among nodes: a, b");
    }

    #[test]
    fn conflict_is_detected() {
        let err: StrataError = StateMachineError::Conflict {
            entity: "run".into(),
            id: "r1".into(),
            expected: "executing".into(),
            found: "paused".into(),
        }
        .into();
        assert!(err.is_conflict());
        assert!(!StrataError::Cancelled.is_conflict());
    }
}
