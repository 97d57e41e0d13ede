use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::types::*;

/// External worker boundary. Starts a unit of work and fetches its answer.
pub trait AgentClient: Send + Sync + 'static {
    /// Open a conversation with the named worker.
    fn create(&self, worker: &str, metadata: Value) -> BoxFuture<'_, Result<ConversationHandle>>;

    /// Send a task message into a conversation.
    fn send(&self, handle: &ConversationHandle, message: &str) -> BoxFuture<'_, Result<()>>;

    /// Fetch the latest worker response, if there is one yet.
    fn poll(&self, handle: &ConversationHandle) -> BoxFuture<'_, Result<Option<String>>>;

    /// Ask the worker to stop. Called when the engine abandons a conversation.
    fn cancel(&self, handle: &ConversationHandle) -> BoxFuture<'_, Result<()>> {
        let _ = handle;
        Box::pin(async { Ok(()) })
    }
}

/// Natural-language reasoning collaborator returning structured verdicts.
pub trait SemanticOracle: Send + Sync + 'static {
    fn evaluate(&self, request: OracleRequest) -> BoxFuture<'_, Result<Value>>;
}

/// Read-only source of worker profiles.
pub trait ProfileSource: Send + Sync + 'static {
    fn profiles(&self) -> BoxFuture<'_, Result<Vec<AgentProfile>>>;
}

/// Execution record persistence.
pub trait ExecutionStore: Send + Sync + 'static {
    fn create(&self, seed: ExecutionSeed) -> BoxFuture<'_, Result<ExecutionId>>;

    fn update(&self, id: &ExecutionId, update: ExecutionUpdate) -> BoxFuture<'_, Result<()>>;

    fn get(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<WorkflowExecution>>>;
}

/// Approval request persistence.
pub trait ApprovalStore: Send + Sync + 'static {
    fn create(&self, seed: ApprovalSeed) -> BoxFuture<'_, Result<String>>;

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<ApprovalRecord>>>;

    /// Record a reviewer decision. Returns false if the request is unknown
    /// or already resolved.
    fn resolve(&self, id: &str, decision: ApprovalDecision) -> BoxFuture<'_, Result<bool>>;

    fn list_pending(&self) -> BoxFuture<'_, Result<Vec<ApprovalRecord>>>;

    /// Push-based completion for stores that can signal a resolution.
    /// `None` means the caller has to poll `get`.
    fn watch(&self, id: &str) -> BoxFuture<'_, Option<oneshot::Receiver<ApprovalRecord>>> {
        let _ = id;
        Box::pin(async { None })
    }

    /// Drop watchers whose receivers were abandoned, e.g. by a gate that
    /// timed out.
    fn unwatch(&self, id: &str) -> BoxFuture<'_, ()> {
        let _ = id;
        Box::pin(async {})
    }
}

/// Checkpoint persistence for resumable executions.
pub trait CheckpointStore: Send + Sync + 'static {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>>;

    fn load(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    fn delete(&self, execution_id: &str) -> BoxFuture<'_, Result<()>>;
}

/// Failure notification delivery.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, address: &str, subject: &str, body: &str) -> BoxFuture<'_, Result<()>>;
}

/// Synchronous progress callback. Purely observational.
pub trait ProgressObserver: Send + Sync + 'static {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Send + Sync + 'static,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}
