use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::workflow::WorkflowDefinition;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Execution records ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Outcome of one node, accumulated into the execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub node_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Fields for a new execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSeed {
    pub workflow_id: String,
    pub workflow_name: String,
    pub input: Value,
    pub status: ExecutionStatus,
    pub current_step: usize,
    pub step_results: Vec<StepResult>,
    pub context: Value,
}

impl ExecutionSeed {
    pub fn for_workflow(workflow: &WorkflowDefinition, input: Value) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            input,
            status: ExecutionStatus::Running,
            current_step: 0,
            step_results: vec![],
            context: Value::Object(workflow.variables.clone()),
        }
    }
}

/// Partial update applied at a terminal transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub current_step: Option<usize>,
    #[serde(default)]
    pub step_results: Option<Vec<StepResult>>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// The persisted record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub context: Value,
    pub current_step: usize,
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn from_seed(id: ExecutionId, seed: ExecutionSeed) -> Self {
        Self {
            id,
            workflow_id: seed.workflow_id,
            workflow_name: seed.workflow_name,
            status: seed.status,
            input: seed.input,
            context: seed.context,
            current_step: seed.current_step,
            step_results: seed.step_results,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: ExecutionUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(step) = update.current_step {
            self.current_step = step;
        }
        if let Some(results) = update.step_results {
            self.step_results = results;
        }
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if update.finished_at.is_some() {
            self.finished_at = update.finished_at;
        }
    }
}

// ── Approvals ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Fields for a new approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSeed {
    pub execution_id: String,
    pub node_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Data awaiting review.
    pub data: Value,
    pub context: Value,
}

/// A reviewer's decision on a pending approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// Approve, optionally replacing the reviewed data.
    Approved {
        #[serde(default)]
        reviewed_data: Option<Value>,
    },
    Rejected {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub approvers: Vec<String>,
    pub data: Value,
    pub context: Value,
    #[serde(default)]
    pub reviewed_data: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRecord {
    pub fn from_seed(id: impl Into<String>, seed: ApprovalSeed) -> Self {
        Self {
            id: id.into(),
            execution_id: seed.execution_id,
            node_id: seed.node_id,
            status: ApprovalStatus::Pending,
            message: seed.message,
            approvers: seed.approvers,
            data: seed.data,
            context: seed.context,
            reviewed_data: None,
            reason: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Apply a decision. Returns false if the record was already resolved.
    pub fn resolve(&mut self, decision: ApprovalDecision) -> bool {
        if self.status != ApprovalStatus::Pending {
            return false;
        }
        match decision {
            ApprovalDecision::Approved { reviewed_data } => {
                self.status = ApprovalStatus::Approved;
                self.reviewed_data = reviewed_data;
            }
            ApprovalDecision::Rejected { reason } => {
                self.status = ApprovalStatus::Rejected;
                self.reason = reason;
            }
        }
        self.resolved_at = Some(Utc::now());
        true
    }
}

// ── Agents ──────────────────────────────────────────────────────

/// A worker's declared abilities and rolling statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub specialties: Vec<String>,
    /// Historical success rate in `0.0..=1.0`.
    #[serde(default)]
    pub success_rate: f64,
    /// Tasks currently in flight.
    #[serde(default)]
    pub active_tasks: u32,
    #[serde(default)]
    pub completed_tasks: u32,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_strengths(mut self, strengths: Vec<String>) -> Self {
        self.strengths = strengths;
        self
    }

    pub fn with_stats(mut self, success_rate: f64, active_tasks: u32) -> Self {
        self.success_rate = success_rate;
        self.active_tasks = active_tasks;
        self
    }
}

/// Opaque handle to a conversation with an external worker.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationHandle(pub String);

impl std::fmt::Display for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Oracle ──────────────────────────────────────────────────────

/// A natural-language question with the JSON shape the answer must take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleRequest {
    pub prompt: String,
    pub schema: Value,
}

// ── Progress ────────────────────────────────────────────────────

/// State transitions reported to progress observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Retrying,
    Completed,
    ErrorHandling,
    Skipped,
    UsingFallback,
    ErrorContinue,
    WaitingApproval,
    Approved,
    SelectingAgent,
    AgentSelected,
    LoopStart,
    LoopIteration,
    LoopComplete,
    LoopError,
}

/// One progress notification: `{ nodeId, status, ...detail }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub status: ProgressStatus,
    #[serde(flatten)]
    pub detail: serde_json::Map<String, Value>,
}

impl ProgressEvent {
    pub fn new(node_id: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            node_id: node_id.into(),
            status,
            detail: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.detail.get(key)
    }
}

// ── Checkpoints ─────────────────────────────────────────────────

/// Serializable position of a walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub node_id: String,
    pub input: Value,
    pub context: ExecutionContext,
}

/// Everything needed to continue an execution after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: String,
    pub workflow: WorkflowDefinition,
    pub cursor: Cursor,
    /// Number of top-level steps taken before this cursor.
    pub step: usize,
    pub step_results: Vec<StepResult>,
    pub timestamp: DateTime<Utc>,
}
