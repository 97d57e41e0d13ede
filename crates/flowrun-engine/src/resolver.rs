use flowrun_core::error::FlowError;
use flowrun_core::workflow::{ErrorAction, Node, NodeKind, WorkflowDefinition};

/// What to do with a node that has exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Pass the original input along the untagged edge.
    Skip,
    /// Like `Skip`, with the error message in the context's error overlay.
    Continue { message: String },
    /// One attempt against a fallback worker.
    FallbackAgent(String),
    /// Continue the walk at another node with the original input.
    FallbackNode(String),
    /// Propagate the error.
    Fail,
}

/// The effective error action: node `on_error`, then the workflow
/// `fallback_strategy`, then `fail`.
pub fn action_for(node: &Node, workflow: &WorkflowDefinition) -> ErrorAction {
    node.on_error
        .or(workflow.error_handling.fallback_strategy)
        .unwrap_or_default()
}

pub fn action_label(action: ErrorAction) -> &'static str {
    match action {
        ErrorAction::Skip => "skip",
        ErrorAction::Fallback => "fallback",
        ErrorAction::Continue => "continue",
        ErrorAction::Fail => "fail",
    }
}

/// Decide how to recover from `error` at `node`.
pub fn plan(node: &Node, workflow: &WorkflowDefinition, error: &FlowError) -> Recovery {
    if error.is_fatal() {
        return Recovery::Fail;
    }

    match action_for(node, workflow) {
        ErrorAction::Skip => Recovery::Skip,
        ErrorAction::Continue => Recovery::Continue {
            message: error.to_string(),
        },
        ErrorAction::Fallback => {
            let fallback_agent = match &node.kind {
                NodeKind::Agent(agent) => agent.fallback_agents.first().cloned(),
                _ => None,
            };
            match (fallback_agent, &node.fallback_node) {
                (Some(worker), _) => Recovery::FallbackAgent(worker),
                (None, Some(target)) => Recovery::FallbackNode(target.clone()),
                (None, None) => Recovery::Fail,
            }
        }
        ErrorAction::Fail => Recovery::Fail,
    }
}
