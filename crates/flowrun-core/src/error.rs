use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Node errors
    #[error("Node {node_id} failed: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Node {node_id} timed out after {timeout_secs}s")]
    Timeout { node_id: String, timeout_secs: u64 },

    #[error("No response from worker {worker} after {attempts} polls")]
    ResponseTimeout { worker: String, attempts: u32 },

    #[error("Fallback for node {node_id} failed: {fallback} (original error: {primary})")]
    FallbackFailed {
        node_id: String,
        primary: String,
        fallback: String,
    },

    #[error("Loop {node_id} failed after {total_iterations} iterations: {message}")]
    LoopFailed {
        node_id: String,
        total_iterations: usize,
        message: String,
    },

    // Selection errors
    #[error("No eligible worker for node {node_id}")]
    NoEligibleWorker { node_id: String },

    #[error("Oracle selected unknown worker: {name}")]
    InvalidSelection { name: String },

    // Approval errors
    #[error("Approval rejected at node {node_id}: {reason}")]
    ApprovalRejected { node_id: String, reason: String },

    #[error("Approval timeout at node {node_id} after {attempts} checks")]
    ApprovalTimeout { node_id: String, attempts: u32 },

    // Condition errors
    #[error("Condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    // Definition errors
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Collaborator errors
    #[error("Agent error: {worker}: {message}")]
    Agent { worker: String, message: String },

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Wrap any failure as a node execution error for `node_id`.
    pub fn node(node_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            message: message.to_string(),
        }
    }

    /// Malformed definitions and cancellation end the run without retry or recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownNodeType(_)
                | Self::InvalidWorkflow(_)
                | Self::NodeNotFound(_)
                | Self::Cancelled
        )
    }

    /// Whether another attempt at the same node could succeed.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
            && !matches!(
                self,
                Self::ApprovalRejected { .. } | Self::ApprovalTimeout { .. }
            )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_errors_are_fatal() {
        assert!(FlowError::UnknownNodeType("webhook".into()).is_fatal());
        assert!(FlowError::NodeNotFound("x".into()).is_fatal());
        assert!(FlowError::Cancelled.is_fatal());
        assert!(!FlowError::node("a", "boom").is_fatal());
    }

    #[test]
    fn human_decisions_are_not_retried() {
        let rejected = FlowError::ApprovalRejected {
            node_id: "review".into(),
            reason: "no".into(),
        };
        assert!(!rejected.is_fatal());
        assert!(!rejected.is_retryable());

        let timeout = FlowError::Timeout {
            node_id: "a".into(),
            timeout_secs: 1,
        };
        assert!(timeout.is_retryable());
    }

    #[test]
    fn fallback_message_cites_both_causes() {
        let err = FlowError::FallbackFailed {
            node_id: "write".into(),
            primary: "primary down".into(),
            fallback: "backup down".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("primary down"));
        assert!(msg.contains("backup down"));
    }
}
