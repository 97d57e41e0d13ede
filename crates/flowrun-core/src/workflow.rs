//! Workflow definitions: the immutable graph a run walks.
//!
//! A workflow is an ordered list of `Node`s connected by `Edge`s. Node
//! configuration is a closed tagged union, so a malformed definition fails at
//! load time instead of halfway through a run.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};

/// Label marking the edge from a loop node to its body.
pub const LOOP_BODY_LABEL: &str = "loop_body";

/// Node type tags accepted in workflow files.
pub const NODE_TYPES: &[&str] = &["agent", "condition", "parallel", "approval", "loop", "end"];

pub type VariableMap = serde_json::Map<String, Value>;

/// A user-authored workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Initial context bindings.
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub error_handling: ErrorHandlingPolicy,
    /// Explicit entry node; inferred from the edges when absent.
    #[serde(default)]
    pub start_node: Option<String>,
    /// Addresses notified when a run fails.
    #[serde(default)]
    pub notify_on_failure: Vec<String>,
}

/// Workflow-wide retry and recovery defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingPolicy {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_strategy: Option<BackoffStrategy>,
    #[serde(default)]
    pub retry_delay_secs: Option<f64>,
    #[serde(default)]
    pub fallback_strategy: Option<ErrorAction>,
}

/// Delay discipline between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    ExponentialBackoff,
    FixedDelay,
    Immediate,
}

/// What to do once a node has exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Skip,
    Fallback,
    Continue,
    #[default]
    Fail,
}

/// A single step in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_strategy: Option<BackoffStrategy>,
    #[serde(default)]
    pub retry_delay_secs: Option<f64>,
    #[serde(default)]
    pub on_error: Option<ErrorAction>,
    /// Node to continue at when the `fallback` policy applies.
    #[serde(default)]
    pub fallback_node: Option<String>,
}

/// Kind-specific node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Agent(AgentNode),
    Condition(ConditionNode),
    Parallel,
    Approval(ApprovalNode),
    Loop(LoopNode),
    End,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Agent(_) => "agent",
            NodeKind::Condition(_) => "condition",
            NodeKind::Parallel => "parallel",
            NodeKind::Approval(_) => "approval",
            NodeKind::Loop(_) => "loop",
            NodeKind::End => "end",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentNode {
    /// Statically configured worker name.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Pick the worker at run time instead of using `agent`.
    #[serde(default)]
    pub selection: Option<AgentSelection>,
    #[serde(default)]
    pub fallback_agents: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSelection {
    /// Eligible workers; empty means every known profile.
    #[serde(default)]
    pub candidates: Vec<String>,
    /// Present = deterministic scoring, absent = ask the oracle.
    #[serde(default)]
    pub criteria: Option<SelectionCriteria>,
    /// Task summary shown to the oracle.
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionCriteria {
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub max_workload: Option<u32>,
    #[serde(default)]
    pub min_success_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionNode {
    /// Single legacy predicate.
    #[serde(default)]
    pub condition: Option<Predicate>,
    /// Structured conditions, combined left to right.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    SemanticDecision {
        prompt: String,
    },
    Contains {
        value: String,
        #[serde(default)]
        field: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub logic: Logic,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            logic: Logic::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.logic = Logic::Or;
        self
    }
}

/// Structured comparison operator. Anything unrecognised is kept verbatim
/// and judged by the semantic oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
    IsEmpty,
    Other(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Contains => "contains",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::Exists => "exists",
            Operator::IsEmpty => "is_empty",
            Operator::Other(name) => name,
        }
    }
}

impl From<String> for Operator {
    fn from(s: String) -> Self {
        match s.as_str() {
            "equals" => Operator::Equals,
            "not_equals" => Operator::NotEquals,
            "contains" => Operator::Contains,
            "greater_than" => Operator::GreaterThan,
            "less_than" => Operator::LessThan,
            "exists" => Operator::Exists,
            "is_empty" => Operator::IsEmpty,
            _ => Operator::Other(s),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic {
    #[default]
    #[serde(rename = "and", alias = "AND")]
    And,
    #[serde(rename = "or", alias = "OR")]
    Or,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalNode {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub approvers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopNode {
    pub loop_type: LoopType,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default = "default_break_on_error")]
    pub break_on_error: bool,
    /// Dotted path to the array iterated by `foreach`.
    #[serde(default)]
    pub array_path: Option<String>,
    /// Natural-language condition for `while` / `until`.
    #[serde(default)]
    pub condition: Option<String>,
}

fn default_break_on_error() -> bool {
    true
}

impl LoopNode {
    pub fn new(loop_type: LoopType) -> Self {
        Self {
            loop_type,
            max_iterations: None,
            break_on_error: default_break_on_error(),
            array_path: None,
            condition: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    Foreach,
    While,
    Until,
    FixedCount,
}

impl LoopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopType::Foreach => "foreach",
            LoopType::While => "while",
            LoopType::Until => "until",
            LoopType::FixedCount => "fixed_count",
        }
    }
}

/// Outcome tag on an edge leaving a condition node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchTag {
    #[serde(rename = "true")]
    True,
    #[serde(rename = "false")]
    False,
}

impl From<bool> for BranchTag {
    fn from(b: bool) -> Self {
        if b {
            BranchTag::True
        } else {
            BranchTag::False
        }
    }
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<BranchTag>,
    #[serde(default)]
    pub label: Option<String>,
}

impl Edge {
    /// Create an untagged edge.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
            label: None,
        }
    }

    /// Create an edge taken when a condition node evaluates to `outcome`.
    pub fn branch(source: impl Into<String>, target: impl Into<String>, outcome: bool) -> Self {
        Self {
            condition: Some(outcome.into()),
            ..Self::new(source, target)
        }
    }

    /// Create the edge from a loop node to its body.
    pub fn loop_body(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            label: Some(LOOP_BODY_LABEL.to_string()),
            ..Self::new(source, target)
        }
    }

    pub fn is_loop_body(&self) -> bool {
        self.label.as_deref() == Some(LOOP_BODY_LABEL)
    }
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            max_retries: None,
            retry_strategy: None,
            retry_delay_secs: None,
            on_error: None,
            fallback_node: None,
        }
    }

    /// Agent node bound to a fixed worker.
    pub fn agent(id: impl Into<String>, worker: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Agent(AgentNode {
                agent: Some(worker.into()),
                ..Default::default()
            }),
        )
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, strategy: BackoffStrategy, delay_secs: f64) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_strategy = Some(strategy);
        self.retry_delay_secs = Some(delay_secs);
        self
    }

    pub fn with_on_error(mut self, action: ErrorAction) -> Self {
        self.on_error = Some(action);
        self
    }

    pub fn with_fallback_node(mut self, node_id: impl Into<String>) -> Self {
        self.fallback_node = Some(node_id.into());
        self
    }
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            nodes: vec![],
            edges: vec![],
            variables: VariableMap::new(),
            error_handling: ErrorHandlingPolicy::default(),
            start_node: None,
            notify_on_failure: vec![],
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Load and validate a workflow file (`.toml`, anything else is JSON).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Self::from_toml(&content)
        } else {
            Self::from_json(&content)
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(content)?;
        Self::from_value(raw)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: Value =
            toml::from_str(content).map_err(|e| FlowError::InvalidWorkflow(e.to_string()))?;
        Self::from_value(raw)
    }

    fn from_value(raw: Value) -> Result<Self> {
        check_node_types(&raw)?;
        let workflow: Self =
            serde_json::from_value(raw).map_err(|e| FlowError::InvalidWorkflow(e.to_string()))?;
        workflow.validate()?;
        Ok(workflow)
    }

    pub fn find_node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node(&self, node_id: &str) -> Result<&Node> {
        self.find_node(node_id)
            .ok_or_else(|| FlowError::NodeNotFound(node_id.to_string()))
    }

    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        let node_id = node_id.to_string();
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// The edge a node continues along when it has no branch outcome:
    /// the first untagged, non-body edge.
    pub fn next_edge(&self, node_id: &str) -> Option<&Edge> {
        self.outgoing(node_id)
            .find(|e| e.condition.is_none() && !e.is_loop_body())
    }

    /// The edge tagged with a condition outcome.
    pub fn branch_edge(&self, node_id: &str, outcome: bool) -> Option<&Edge> {
        let tag = BranchTag::from(outcome);
        self.outgoing(node_id).find(|e| e.condition == Some(tag))
    }

    pub fn loop_body_edge(&self, node_id: &str) -> Option<&Edge> {
        self.outgoing(node_id).find(|e| e.is_loop_body())
    }

    /// Resolve the logical start node.
    pub fn start(&self) -> Result<&Node> {
        if let Some(ref id) = self.start_node {
            return self.node(id);
        }

        let targets: HashSet<&str> = self.edges.iter().map(|e| e.target.as_str()).collect();
        let fallbacks: HashSet<&str> = self
            .nodes
            .iter()
            .filter_map(|n| n.fallback_node.as_deref())
            .collect();

        let roots: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| !targets.contains(n.id.as_str()) && !fallbacks.contains(n.id.as_str()))
            .collect();

        match roots.as_slice() {
            [only] => Ok(only),
            [] => Err(FlowError::InvalidWorkflow(
                "no start node: every node has an incoming edge".into(),
            )),
            many => Err(FlowError::InvalidWorkflow(format!(
                "ambiguous start node: {}",
                many.iter().map(|n| n.id.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(FlowError::InvalidWorkflow(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !ids.contains(end.as_str()) {
                    return Err(FlowError::InvalidWorkflow(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
        }

        for node in &self.nodes {
            if let Some(ref fallback) = node.fallback_node {
                if !ids.contains(fallback.as_str()) {
                    return Err(FlowError::InvalidWorkflow(format!(
                        "node '{}' falls back to unknown node '{}'",
                        node.id, fallback
                    )));
                }
            }
            self.validate_node(node)?;
        }

        self.start()?;
        Ok(())
    }

    fn validate_node(&self, node: &Node) -> Result<()> {
        let invalid = |msg: String| Err(FlowError::InvalidWorkflow(format!("node '{}': {}", node.id, msg)));

        match &node.kind {
            NodeKind::Agent(agent) => {
                if agent.agent.is_none() && agent.selection.is_none() {
                    return invalid("agent node needs an agent or a selection".into());
                }
            }
            NodeKind::Condition(cond) => {
                for outcome in [true, false] {
                    let tag = BranchTag::from(outcome);
                    let count = self
                        .outgoing(&node.id)
                        .filter(|e| e.condition == Some(tag))
                        .count();
                    if count > 1 {
                        return invalid(format!("{} edges tagged \"{}\"", count, outcome));
                    }
                }
                if cond.condition.is_none() && cond.conditions.is_empty() {
                    return invalid("condition node has no predicate".into());
                }
            }
            NodeKind::Loop(lp) => {
                let bodies = self.outgoing(&node.id).filter(|e| e.is_loop_body()).count();
                if bodies > 1 {
                    return invalid(format!("{} loop_body edges", bodies));
                }
                if matches!(lp.loop_type, LoopType::While | LoopType::Until)
                    && lp.condition.is_none()
                {
                    return invalid(format!("{} loop needs a condition", lp.loop_type.as_str()));
                }
            }
            NodeKind::Parallel | NodeKind::Approval(_) | NodeKind::End => {}
        }
        Ok(())
    }
}

/// Reject unknown node type tags with a dedicated error before serde
/// collapses them into a generic parse failure.
fn check_node_types(raw: &Value) -> Result<()> {
    let Some(nodes) = raw.get("nodes").and_then(|n| n.as_array()) else {
        return Ok(());
    };
    for node in nodes {
        if let Some(kind) = node
            .get("kind")
            .and_then(|k| k.get("type"))
            .and_then(|t| t.as_str())
        {
            if !NODE_TYPES.contains(&kind) {
                return Err(FlowError::UnknownNodeType(kind.to_string()));
            }
        }
    }
    Ok(())
}
