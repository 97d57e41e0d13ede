//! Mocks and fixtures shared by the flowrun test suites.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{json, Value};

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::*;
use flowrun_core::types::*;
use flowrun_core::workflow::{Edge, Node, WorkflowDefinition};

// ── Oracle ──────────────────────────────────────────────────────

/// Oracle that replays canned verdicts in order. The last one repeats.
pub struct ScriptedOracle {
    responses: Vec<Value>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new(responses: Vec<Value>) -> Self {
        Self {
            responses,
            prompts: Mutex::new(vec![]),
        }
    }

    /// Boolean decisions, in the shape the condition evaluator expects.
    pub fn decisions(decisions: Vec<bool>) -> Self {
        Self::new(
            decisions
                .into_iter()
                .map(|d| json!({ "decision": d, "reasoning": "scripted" }))
                .collect(),
        )
    }

    pub fn always(response: Value) -> Self {
        Self::new(vec![response])
    }

    /// Number of evaluations so far.
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl SemanticOracle for ScriptedOracle {
    fn evaluate(&self, request: OracleRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let index = {
                let mut prompts = self.prompts.lock().unwrap();
                prompts.push(request.prompt);
                prompts.len() - 1
            };
            self.responses
                .get(index)
                .or(self.responses.last())
                .cloned()
                .ok_or_else(|| FlowError::Oracle("scripted oracle has no responses".into()))
        })
    }
}

// ── Agent client ────────────────────────────────────────────────

/// How a mock worker answers one conversation.
#[derive(Clone)]
pub enum AgentBehavior {
    /// Answer with fixed text.
    Reply(String),
    /// Answer with the task message itself.
    Echo,
    /// Answer with the `input` field of the conversation metadata.
    EchoInput,
    /// Answer with a function of the task message.
    Map(Arc<dyn Fn(&str) -> String + Send + Sync>),
    /// Fail when the conversation is created.
    Fail(String),
    /// Never answer.
    Silent,
}

impl AgentBehavior {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }

    pub fn map(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self::Map(Arc::new(f))
    }
}

/// One conversation opened against the mock client.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub worker: String,
    pub metadata: Value,
    pub message: Option<String>,
}

struct Conversation {
    call: usize,
    behavior: AgentBehavior,
    input: String,
    reply: Option<String>,
}

/// Agent client driven by per-worker behavior scripts.
///
/// Each `create` for a worker consumes the next behavior in its script; the
/// last entry repeats. Workers without a script use the default behavior.
pub struct MockAgentClient {
    default: AgentBehavior,
    scripts: HashMap<String, Vec<AgentBehavior>>,
    created: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<AgentCall>>,
    conversations: Mutex<HashMap<String, Conversation>>,
    cancelled: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl MockAgentClient {
    /// Every worker hands back the input it was given.
    pub fn new() -> Self {
        Self::with_default(AgentBehavior::EchoInput)
    }

    pub fn with_default(default: AgentBehavior) -> Self {
        Self {
            default,
            scripts: HashMap::new(),
            created: Mutex::new(HashMap::new()),
            calls: Mutex::new(vec![]),
            conversations: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(vec![]),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn script(mut self, worker: impl Into<String>, behaviors: Vec<AgentBehavior>) -> Self {
        self.scripts.insert(worker.into(), behaviors);
        self
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls made to one worker.
    pub fn calls_to(&self, worker: &str) -> Vec<AgentCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.worker == worker)
            .collect()
    }

    /// Handles the engine asked to cancel.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    fn next_behavior(&self, worker: &str) -> AgentBehavior {
        let Some(script) = self.scripts.get(worker).filter(|s| !s.is_empty()) else {
            return self.default.clone();
        };
        let mut created = self.created.lock().unwrap();
        let n = created.entry(worker.to_string()).or_insert(0);
        let behavior = script[(*n).min(script.len() - 1)].clone();
        *n += 1;
        behavior
    }
}

impl Default for MockAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentClient for MockAgentClient {
    fn create(&self, worker: &str, metadata: Value) -> BoxFuture<'_, Result<ConversationHandle>> {
        let worker = worker.to_string();
        Box::pin(async move {
            let behavior = self.next_behavior(&worker);
            let input = match metadata.get("input") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(AgentCall {
                    worker: worker.clone(),
                    metadata,
                    message: None,
                });
                calls.len() - 1
            };

            if let AgentBehavior::Fail(message) = behavior {
                return Err(FlowError::Agent { worker, message });
            }

            let id = format!("conv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.conversations.lock().unwrap().insert(
                id.clone(),
                Conversation {
                    call,
                    behavior,
                    input,
                    reply: None,
                },
            );
            Ok(ConversationHandle(id))
        })
    }

    fn send(&self, handle: &ConversationHandle, message: &str) -> BoxFuture<'_, Result<()>> {
        let handle = handle.clone();
        let message = message.to_string();
        Box::pin(async move {
            let mut conversations = self.conversations.lock().unwrap();
            let conv = conversations
                .get_mut(&handle.0)
                .ok_or_else(|| FlowError::Agent {
                    worker: "mock".into(),
                    message: format!("unknown conversation {}", handle),
                })?;

            conv.reply = match &conv.behavior {
                AgentBehavior::Reply(text) => Some(text.clone()),
                AgentBehavior::Echo => Some(message.clone()),
                AgentBehavior::EchoInput => Some(conv.input.clone()),
                AgentBehavior::Map(f) => Some(f(&message)),
                AgentBehavior::Fail(_) | AgentBehavior::Silent => None,
            };
            self.calls.lock().unwrap()[conv.call].message = Some(message);
            Ok(())
        })
    }

    fn poll(&self, handle: &ConversationHandle) -> BoxFuture<'_, Result<Option<String>>> {
        let handle = handle.clone();
        Box::pin(async move {
            Ok(self
                .conversations
                .lock()
                .unwrap()
                .get(&handle.0)
                .and_then(|c| c.reply.clone()))
        })
    }

    fn cancel(&self, handle: &ConversationHandle) -> BoxFuture<'_, Result<()>> {
        let handle = handle.clone();
        Box::pin(async move {
            self.cancelled.lock().unwrap().push(handle.0);
            Ok(())
        })
    }
}

// ── Stores ──────────────────────────────────────────────────────

/// Execution records kept in memory.
#[derive(Default)]
pub struct MemoryExecutionStore {
    records: Mutex<HashMap<String, WorkflowExecution>>,
    updates: AtomicUsize,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<WorkflowExecution> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    /// Number of `update` calls seen.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn create(&self, seed: ExecutionSeed) -> BoxFuture<'_, Result<ExecutionId>> {
        Box::pin(async move {
            let id = ExecutionId::new();
            self.records
                .lock()
                .unwrap()
                .insert(id.0.clone(), WorkflowExecution::from_seed(id.clone(), seed));
            Ok(id)
        })
    }

    fn update(&self, id: &ExecutionId, update: ExecutionUpdate) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        Box::pin(async move {
            self.updates.fetch_add(1, Ordering::SeqCst);
            let mut records = self.records.lock().unwrap();
            let record = records
                .get_mut(&id.0)
                .ok_or_else(|| FlowError::Store(format!("unknown execution {}", id)))?;
            record.apply(update);
            Ok(())
        })
    }

    fn get(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<WorkflowExecution>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.records.lock().unwrap().get(&id.0).cloned()) })
    }
}

/// Checkpoints kept in memory, with a save counter.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.lock().unwrap().is_empty()
    }

    /// Seed a checkpoint directly, as if a previous process had saved it.
    pub fn insert(&self, checkpoint: Checkpoint) {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.execution_id.clone(), checkpoint);
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.insert(checkpoint);
            Ok(())
        })
    }

    fn load(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move { Ok(self.checkpoints.lock().unwrap().get(&execution_id).cloned()) })
    }

    fn delete(&self, execution_id: &str) -> BoxFuture<'_, Result<()>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            self.checkpoints.lock().unwrap().remove(&execution_id);
            Ok(())
        })
    }
}

/// Approval store without push completion. Once `get` has been called
/// `after` times on a pending request, it applies the scripted decision.
pub struct ScriptedApprovalStore {
    decision: ApprovalDecision,
    after: usize,
    records: Mutex<HashMap<String, ApprovalRecord>>,
    gets: AtomicUsize,
}

impl ScriptedApprovalStore {
    pub fn new(decision: ApprovalDecision, after: usize) -> Self {
        Self {
            decision,
            after,
            records: Mutex::new(HashMap::new()),
            gets: AtomicUsize::new(0),
        }
    }

    /// A store nobody ever answers.
    pub fn never() -> Self {
        Self::new(ApprovalDecision::Rejected { reason: None }, usize::MAX)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<ApprovalRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }
}

impl ApprovalStore for ScriptedApprovalStore {
    fn create(&self, seed: ApprovalSeed) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let id = format!("approval-{}", self.records.lock().unwrap().len() + 1);
            self.records
                .lock()
                .unwrap()
                .insert(id.clone(), ApprovalRecord::from_seed(id.clone(), seed));
            Ok(id)
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<ApprovalRecord>>> {
        let id = id.to_string();
        Box::pin(async move {
            let seen = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
            let mut records = self.records.lock().unwrap();
            let Some(record) = records.get_mut(&id) else {
                return Ok(None);
            };
            if seen >= self.after {
                record.resolve(self.decision.clone());
            }
            Ok(Some(record.clone()))
        })
    }

    fn resolve(&self, id: &str, decision: ApprovalDecision) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            Ok(self
                .records
                .lock()
                .unwrap()
                .get_mut(&id)
                .is_some_and(|r| r.resolve(decision)))
        })
    }

    fn list_pending(&self) -> BoxFuture<'_, Result<Vec<ApprovalRecord>>> {
        Box::pin(async move {
            Ok(self
                .records()
                .into_iter()
                .filter(|r| r.status == ApprovalStatus::Pending)
                .collect())
        })
    }
}

// ── Observers and notifiers ─────────────────────────────────────

/// Progress observer that keeps every event.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<(String, ProgressStatus)> {
        self.events()
            .into_iter()
            .map(|e| (e.node_id, e.status))
            .collect()
    }

    pub fn count(&self, status: ProgressStatus) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.status == status)
            .count()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// A delivered notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub address: String,
    pub subject: String,
    pub body: String,
}

/// Notifier that records deliveries, optionally failing every one.
#[derive(Default)]
pub struct RecordingNotifier {
    fail: bool,
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Notifications attempted, including failed ones.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, address: &str, subject: &str, body: &str) -> BoxFuture<'_, Result<()>> {
        let note = Notification {
            address: address.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        };
        Box::pin(async move {
            let address = note.address.clone();
            self.sent.lock().unwrap().push(note);
            if self.fail {
                return Err(FlowError::Store(format!("mail relay refused {}", address)));
            }
            Ok(())
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// A straight line of agent nodes `(id, worker)` ending in an `end` node "done".
pub fn chain(id: &str, steps: &[(&str, &str)]) -> WorkflowDefinition {
    let mut wf = WorkflowDefinition::new(id, id);
    for (node_id, worker) in steps {
        wf = wf.with_node(Node::agent(*node_id, *worker));
    }
    wf = wf.with_node(Node::end("done"));

    let ids: Vec<&str> = steps.iter().map(|(n, _)| *n).chain(["done"]).collect();
    for pair in ids.windows(2) {
        wf = wf.with_edge(Edge::new(pair[0], pair[1]));
    }
    wf
}

/// Write `content` to a file named `name` inside a fresh temp dir.
/// Keep the returned dir alive for as long as the file is needed.
pub fn temp_file(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    (dir, path)
}
