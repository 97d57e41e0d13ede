//! The node interpreter.
//!
//! A walk is a sequence of `step()` calls, each of which runs one node
//! (with retries and error recovery) and reports either the next cursor or
//! the walk's terminal output. The cursor is plain data, so the top-level
//! driver can checkpoint it between steps.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use flowrun_core::config::EngineConfig;
use flowrun_core::context::ExecutionContext;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::{ProgressObserver, SemanticOracle};
use flowrun_core::types::*;
use flowrun_core::workflow::{AgentNode, Node, NodeKind, WorkflowDefinition};

use crate::approval::ApprovalGate;
use crate::condition::ConditionEvaluator;
use crate::invocation::{build_task_message, AgentInvoker, AgentTask};
use crate::resolver::{self, Recovery};
use crate::retry::RetryPolicy;
use crate::selector::AgentSelector;

/// Result of one interpreter step.
#[derive(Debug, Clone)]
pub enum Step {
    /// Continue at another node.
    Next(Cursor),
    /// The walk is over.
    Done(Value),
}

/// What a node produced, before edge selection.
#[derive(Debug, Clone)]
pub(crate) enum Effect {
    /// An output to bind under the node id and carry along the untagged edge.
    Output(Value),
    /// A condition outcome selecting a tagged edge.
    Branch(bool),
    /// The walk ends here with this value.
    Terminal(Value),
}

/// Per-execution state shared by every walk of one run.
pub struct Run<'a> {
    pub workflow: &'a WorkflowDefinition,
    pub execution_id: &'a str,
    results: Mutex<Vec<StepResult>>,
}

impl<'a> Run<'a> {
    pub fn new(workflow: &'a WorkflowDefinition, execution_id: &'a str, results: Vec<StepResult>) -> Self {
        Self {
            workflow,
            execution_id,
            results: Mutex::new(results),
        }
    }

    pub fn record(&self, result: StepResult) {
        if let Ok(mut results) = self.results.lock() {
            results.push(result);
        }
    }

    pub fn results(&self) -> Vec<StepResult> {
        self.results.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

/// Walks workflow graphs against the configured collaborators.
pub struct Interpreter {
    pub(crate) config: EngineConfig,
    pub(crate) invoker: AgentInvoker,
    pub(crate) selector: AgentSelector,
    pub(crate) conditions: ConditionEvaluator,
    pub(crate) gate: ApprovalGate,
    pub(crate) oracle: Option<Arc<dyn SemanticOracle>>,
    pub(crate) observer: Arc<dyn ProgressObserver>,
}

impl Interpreter {
    pub fn new(
        config: EngineConfig,
        invoker: AgentInvoker,
        selector: AgentSelector,
        gate: ApprovalGate,
        oracle: Option<Arc<dyn SemanticOracle>>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            config,
            invoker,
            selector,
            conditions: ConditionEvaluator::new(oracle.clone()),
            gate,
            oracle,
            observer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        self.observer.on_progress(&event);
    }

    /// Walk from `cursor` until the graph terminates.
    pub fn walk<'a>(&'a self, run: &'a Run<'a>, cursor: Cursor) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let mut cursor = cursor;
            let mut steps = 0u32;
            loop {
                if steps >= self.config.max_steps {
                    return Err(FlowError::node(
                        &cursor.node_id,
                        format!("step limit of {} exceeded", self.config.max_steps),
                    ));
                }
                steps += 1;
                match self.step(run, cursor).await? {
                    Step::Next(next) => cursor = next,
                    Step::Done(output) => return Ok(output),
                }
            }
        })
    }

    /// Run the node under `cursor` and pick where the walk goes next.
    pub async fn step(&self, run: &Run<'_>, cursor: Cursor) -> Result<Step> {
        let workflow = run.workflow;
        let node = workflow.node(&cursor.node_id)?;

        info!(node_id = %node.id, kind = node.kind.label(), "Executing node");
        self.emit(
            ProgressEvent::new(&node.id, ProgressStatus::Running)
                .with("type", node.kind.label())
                .with("name", node.name.clone()),
        );

        let policy = RetryPolicy::resolve(node, workflow, &self.config);
        let started = Instant::now();
        let outcome = policy
            .run(
                |_| self.execute(run, node, &cursor.input, &cursor.context),
                |attempt, err, wait| {
                    self.emit(
                        ProgressEvent::new(&node.id, ProgressStatus::Retrying)
                            .with("attempt", attempt)
                            .with("max_attempts", policy.max_attempts)
                            .with("delay_ms", wait.as_millis() as u64)
                            .with("error", err.to_string()),
                    );
                },
            )
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(effect) => {
                let output = match &effect {
                    Effect::Output(v) | Effect::Terminal(v) => v.clone(),
                    Effect::Branch(b) => Value::Bool(*b),
                };
                debug!(node_id = %node.id, elapsed_ms, "Node complete");
                self.emit(
                    ProgressEvent::new(&node.id, ProgressStatus::Completed)
                        .with("elapsed_ms", elapsed_ms),
                );
                run.record(StepResult {
                    node_id: node.id.clone(),
                    status: "completed".into(),
                    output: Some(output),
                    error: None,
                    elapsed_ms,
                });
                Ok(self.advance(workflow, node, cursor, effect))
            }
            Err(e) => {
                error!(node_id = %node.id, error = %e, "Node failed");
                run.record(StepResult {
                    node_id: node.id.clone(),
                    status: "failed".into(),
                    output: None,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                if e.is_fatal() {
                    return Err(e);
                }
                self.recover(run, node, cursor, e).await
            }
        }
    }

    /// Kind dispatch for a single attempt.
    async fn execute(
        &self,
        run: &Run<'_>,
        node: &Node,
        input: &Value,
        context: &ExecutionContext,
    ) -> Result<Effect> {
        match &node.kind {
            NodeKind::Agent(agent) => {
                let worker = self.resolve_worker(node, agent).await?;
                self.run_agent(run, node, agent, &worker, input, context)
                    .await
                    .map(Effect::Output)
            }
            NodeKind::Condition(cond) => self
                .conditions
                .evaluate(cond, input, context)
                .await
                .map(Effect::Branch),
            NodeKind::Parallel => self
                .run_parallel(run, node, input, context)
                .await
                .map(Effect::Terminal),
            NodeKind::Approval(approval) => self
                .gate
                .wait(
                    &node.id,
                    run.execution_id,
                    approval,
                    input,
                    context,
                    self.observer.as_ref(),
                )
                .await
                .map(Effect::Output),
            NodeKind::Loop(lp) => {
                let outcome = self.run_loop(run, node, lp, input, context).await?;
                Ok(Effect::Output(serde_json::to_value(outcome)?))
            }
            NodeKind::End => Ok(Effect::Terminal(input.clone())),
        }
    }

    /// Pick the worker for an agent node, consulting the selector when the
    /// node asks for dynamic selection.
    async fn resolve_worker(&self, node: &Node, agent: &AgentNode) -> Result<String> {
        let Some(ref selection) = agent.selection else {
            return agent.agent.clone().ok_or_else(|| FlowError::NoEligibleWorker {
                node_id: node.id.clone(),
            });
        };

        self.emit(ProgressEvent::new(&node.id, ProgressStatus::SelectingAgent));
        let worker = self
            .selector
            .select(selection, &agent.instructions)
            .await?
            .ok_or_else(|| FlowError::NoEligibleWorker {
                node_id: node.id.clone(),
            })?;
        self.emit(
            ProgressEvent::new(&node.id, ProgressStatus::AgentSelected).with("agent", worker.clone()),
        );
        Ok(worker)
    }

    async fn run_agent(
        &self,
        run: &Run<'_>,
        node: &Node,
        agent: &AgentNode,
        worker: &str,
        input: &Value,
        context: &ExecutionContext,
    ) -> Result<Value> {
        let timeout = agent.timeout_secs.unwrap_or(self.config.agent_timeout_secs);
        let reply = self
            .invoker
            .invoke(AgentTask {
                node_id: &node.id,
                execution_id: run.execution_id,
                worker,
                message: build_task_message(&agent.instructions, input, context),
                input,
                timeout: Duration::from_secs(timeout),
            })
            .await?;
        Ok(parse_reply(reply))
    }

    /// Choose the next cursor from a node's effect.
    fn advance(&self, workflow: &WorkflowDefinition, node: &Node, cursor: Cursor, effect: Effect) -> Step {
        match effect {
            Effect::Output(output) => {
                let context = cursor.context.with_output(&node.id, output.clone());
                match workflow.next_edge(&node.id) {
                    Some(edge) => Step::Next(Cursor {
                        node_id: edge.target.clone(),
                        input: output,
                        context,
                    }),
                    None => Step::Done(output),
                }
            }
            Effect::Branch(outcome) => {
                debug!(node_id = %node.id, outcome, "Branch selected");
                match workflow.branch_edge(&node.id, outcome) {
                    Some(edge) => Step::Next(Cursor {
                        node_id: edge.target.clone(),
                        input: cursor.input,
                        context: cursor.context.with_output(&node.id, Value::Bool(outcome)),
                    }),
                    None => Step::Done(cursor.input),
                }
            }
            Effect::Terminal(output) => Step::Done(output),
        }
    }

    /// Follow the untagged edge with the node's original input, or end the
    /// walk with it. A parallel node's edges are its branches, so it has no
    /// continuation and always ends the walk.
    fn pass_through(&self, workflow: &WorkflowDefinition, node: &Node, cursor: Cursor) -> Step {
        if matches!(node.kind, NodeKind::Parallel) {
            return Step::Done(cursor.input);
        }
        match workflow.next_edge(&node.id) {
            Some(edge) => Step::Next(Cursor {
                node_id: edge.target.clone(),
                ..cursor
            }),
            None => Step::Done(cursor.input),
        }
    }

    async fn recover(&self, run: &Run<'_>, node: &Node, cursor: Cursor, cause: FlowError) -> Result<Step> {
        let workflow = run.workflow;
        let action = resolver::action_for(node, workflow);
        self.emit(
            ProgressEvent::new(&node.id, ProgressStatus::ErrorHandling)
                .with("strategy", resolver::action_label(action))
                .with("error", cause.to_string()),
        );

        match resolver::plan(node, workflow, &cause) {
            Recovery::Skip => {
                warn!(node_id = %node.id, error = %cause, "Skipping failed node");
                self.emit(ProgressEvent::new(&node.id, ProgressStatus::Skipped));
                Ok(self.pass_through(workflow, node, cursor))
            }
            Recovery::Continue { message } => {
                warn!(node_id = %node.id, error = %cause, "Continuing past failed node");
                self.emit(
                    ProgressEvent::new(&node.id, ProgressStatus::ErrorContinue)
                        .with("error", message.clone()),
                );
                let cursor = Cursor {
                    context: cursor.context.with_error(message),
                    ..cursor
                };
                Ok(self.pass_through(workflow, node, cursor))
            }
            Recovery::FallbackAgent(worker) => {
                let NodeKind::Agent(ref agent) = node.kind else {
                    return Err(cause);
                };
                info!(node_id = %node.id, fallback = %worker, "Trying fallback agent");
                self.emit(
                    ProgressEvent::new(&node.id, ProgressStatus::UsingFallback)
                        .with("fallback_agent", worker.clone()),
                );
                match self
                    .run_agent(run, node, agent, &worker, &cursor.input, &cursor.context)
                    .await
                {
                    Ok(output) => Ok(self.advance(workflow, node, cursor, Effect::Output(output))),
                    Err(fallback) => Err(FlowError::FallbackFailed {
                        node_id: node.id.clone(),
                        primary: cause.to_string(),
                        fallback: fallback.to_string(),
                    }),
                }
            }
            Recovery::FallbackNode(target) => {
                info!(node_id = %node.id, fallback = %target, "Continuing at fallback node");
                self.emit(
                    ProgressEvent::new(&node.id, ProgressStatus::UsingFallback)
                        .with("fallback_node", target.clone()),
                );
                Ok(Step::Next(Cursor {
                    node_id: target,
                    ..cursor
                }))
            }
            Recovery::Fail => Err(cause),
        }
    }
}

/// Structured replies (JSON objects or arrays) become values that
/// conditions can address by path; anything else stays text.
fn parse_reply(reply: String) -> Value {
    let trimmed = reply.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str::<Value>(trimmed) {
            return value;
        }
    }
    Value::String(reply)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flowrun_core::config::{AgentClientConfig, ApprovalConfig};
    use flowrun_core::workflow::{
        BackoffStrategy, Condition, ConditionNode, Edge, ErrorAction, Operator,
    };
    use flowrun_test_utils::{
        chain, AgentBehavior, MockAgentClient, RecordingObserver, ScriptedApprovalStore,
    };
    use serde_json::json;

    use crate::selector::StaticProfiles;

    pub(crate) fn interpreter(
        client: Arc<MockAgentClient>,
        observer: Arc<RecordingObserver>,
    ) -> Interpreter {
        interpreter_with_oracle(client, observer, None)
    }

    pub(crate) fn interpreter_with_oracle(
        client: Arc<MockAgentClient>,
        observer: Arc<RecordingObserver>,
        oracle: Option<Arc<dyn SemanticOracle>>,
    ) -> Interpreter {
        let agent_config = AgentClientConfig {
            poll_interval_ms: 1,
            max_poll_attempts: 5,
            ..Default::default()
        };
        let config = EngineConfig {
            default_backoff: BackoffStrategy::Immediate,
            ..Default::default()
        };
        Interpreter::new(
            config,
            AgentInvoker::new(client, &agent_config),
            AgentSelector::new(Arc::new(StaticProfiles::new(vec![])), None),
            ApprovalGate::new(Arc::new(ScriptedApprovalStore::never()), ApprovalConfig::default()),
            oracle,
            observer,
        )
    }

    pub(crate) fn start(wf: &WorkflowDefinition, input: Value) -> Cursor {
        Cursor {
            node_id: wf.start().unwrap().id.clone(),
            input,
            context: ExecutionContext::from_variables(wf.variables.clone()),
        }
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("{\"score\": 9}".into()), json!({ "score": 9 }));
        assert_eq!(parse_reply("plain".into()), json!("plain"));
        assert_eq!(parse_reply("42".into()), json!("42"));
        assert_eq!(parse_reply("{not json".into()), json!("{not json"));
    }

    #[tokio::test]
    async fn test_linear_walk_threads_output() {
        let client = Arc::new(
            MockAgentClient::new()
                .script("upper", vec![AgentBehavior::map(|_| "STEP ONE".into())]),
        );
        let observer = Arc::new(RecordingObserver::new());
        let interp = interpreter(client.clone(), observer.clone());
        let wf = chain("wf", &[("one", "upper"), ("two", "echo")]);
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!("hello"))).await.unwrap();
        assert_eq!(out, json!("STEP ONE"));

        let second = &client.calls_to("echo")[0];
        assert_eq!(second.metadata["input"], json!("STEP ONE"));
        assert!(second.message.as_deref().unwrap().contains("\"one\": \"STEP ONE\""));

        let results = run.results();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == "completed"));
        assert_eq!(observer.count(ProgressStatus::Running), 3);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let client = Arc::new(MockAgentClient::new().script(
            "flaky",
            vec![
                AgentBehavior::fail("503"),
                AgentBehavior::fail("503"),
                AgentBehavior::reply("ok"),
            ],
        ));
        let observer = Arc::new(RecordingObserver::new());
        let interp = interpreter(client, observer.clone());
        let wf = chain("wf", &[("a", "flaky")]);
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!("in"))).await.unwrap();
        assert_eq!(out, json!("ok"));
        assert_eq!(observer.count(ProgressStatus::Retrying), 2);
    }

    #[tokio::test]
    async fn test_condition_branches() {
        let check = Node::new(
            "check",
            NodeKind::Condition(ConditionNode {
                condition: None,
                conditions: vec![Condition::new("score", Operator::GreaterThan, json!(7))],
            }),
        );
        let wf = WorkflowDefinition::new("wf", "Branch")
            .with_node(check)
            .with_node(Node::agent("good", "praise"))
            .with_node(Node::agent("bad", "critic"))
            .with_edge(Edge::branch("check", "good", true))
            .with_edge(Edge::branch("check", "bad", false));

        let client = Arc::new(MockAgentClient::new());
        let interp = interpreter(client.clone(), Arc::new(RecordingObserver::new()));

        let run = Run::new(&wf, "ex-1", vec![]);
        interp.walk(&run, start(&wf, json!({ "score": 9 }))).await.unwrap();
        let run = Run::new(&wf, "ex-2", vec![]);
        interp.walk(&run, start(&wf, json!({ "score": 3 }))).await.unwrap();

        let workers: Vec<String> = client.calls().into_iter().map(|c| c.worker).collect();
        assert_eq!(workers, vec!["praise", "critic"]);
    }

    #[tokio::test]
    async fn test_condition_without_matching_edge_returns_input() {
        let check = Node::new(
            "check",
            NodeKind::Condition(ConditionNode {
                condition: None,
                conditions: vec![Condition::new("ok", Operator::Exists, Value::Null)],
            }),
        );
        let wf = WorkflowDefinition::new("wf", "Dead end")
            .with_node(check)
            .with_node(Node::end("yes"))
            .with_edge(Edge::branch("check", "yes", true));
        let interp = interpreter(Arc::new(MockAgentClient::new()), Arc::new(RecordingObserver::new()));
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!({ "nope": 1 }))).await.unwrap();
        assert_eq!(out, json!({ "nope": 1 }));
    }

    #[tokio::test]
    async fn test_continue_records_last_error() {
        let wf = WorkflowDefinition::new("wf", "Continue")
            .with_node(
                Node::agent("a", "broken")
                    .with_retries(1, BackoffStrategy::Immediate, 0.0)
                    .with_on_error(ErrorAction::Continue),
            )
            .with_node(Node::agent("b", "reporter"))
            .with_edge(Edge::new("a", "b"));
        let client = Arc::new(
            MockAgentClient::new().script("broken", vec![AgentBehavior::fail("disk full")]),
        );
        let observer = Arc::new(RecordingObserver::new());
        let interp = interpreter(client.clone(), observer.clone());
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!("original"))).await.unwrap();
        assert_eq!(out, json!("original"));

        let report = &client.calls_to("reporter")[0];
        assert!(report.message.as_deref().unwrap().contains("disk full"));
        assert_eq!(observer.count(ProgressStatus::ErrorContinue), 1);
        assert_eq!(run.results()[0].status, "failed");
    }

    #[tokio::test]
    async fn test_skipped_parallel_does_not_rerun_branches() {
        let wf = WorkflowDefinition::new("wf", "Fan out")
            .with_node(
                Node::new("split", NodeKind::Parallel)
                    .with_retries(1, BackoffStrategy::Immediate, 0.0)
                    .with_on_error(ErrorAction::Skip),
            )
            .with_node(Node::agent("x", "bad").with_retries(1, BackoffStrategy::Immediate, 0.0))
            .with_node(Node::agent("y", "good"))
            .with_edge(Edge::new("split", "x"))
            .with_edge(Edge::new("split", "y"));
        let client = Arc::new(MockAgentClient::new().script(
            "bad",
            vec![AgentBehavior::fail("boom"), AgentBehavior::reply("x second try")],
        ));
        let observer = Arc::new(RecordingObserver::new());
        let interp = interpreter(client.clone(), observer.clone());
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!("orig"))).await.unwrap();
        assert_eq!(out, json!("orig"));
        assert_eq!(client.calls_to("bad").len(), 1);
        assert_eq!(client.calls_to("good").len(), 1);
        assert_eq!(observer.count(ProgressStatus::Skipped), 1);
    }

    #[tokio::test]
    async fn test_fallback_agent_single_attempt() {
        let agent = Node::new(
            "a",
            NodeKind::Agent(AgentNode {
                agent: Some("primary".into()),
                fallback_agents: vec!["backup".into()],
                ..Default::default()
            }),
        )
        .with_retries(2, BackoffStrategy::Immediate, 0.0)
        .with_on_error(ErrorAction::Fallback);
        let wf = WorkflowDefinition::new("wf", "Fallback").with_node(agent);

        let client = Arc::new(
            MockAgentClient::new()
                .script("primary", vec![AgentBehavior::fail("down")])
                .script("backup", vec![AgentBehavior::reply("rescued")]),
        );
        let observer = Arc::new(RecordingObserver::new());
        let interp = interpreter(client.clone(), observer.clone());
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!("in"))).await.unwrap();
        assert_eq!(out, json!("rescued"));
        assert_eq!(client.calls_to("primary").len(), 2);
        assert_eq!(client.calls_to("backup").len(), 1);
        assert_eq!(observer.count(ProgressStatus::UsingFallback), 1);
    }

    #[tokio::test]
    async fn test_fallback_agent_failure_cites_both() {
        let agent = Node::new(
            "a",
            NodeKind::Agent(AgentNode {
                agent: Some("primary".into()),
                fallback_agents: vec!["backup".into()],
                ..Default::default()
            }),
        )
        .with_retries(1, BackoffStrategy::Immediate, 0.0)
        .with_on_error(ErrorAction::Fallback);
        let wf = WorkflowDefinition::new("wf", "Fallback").with_node(agent);

        let client = Arc::new(
            MockAgentClient::new()
                .script("primary", vec![AgentBehavior::fail("primary down")])
                .script("backup", vec![AgentBehavior::fail("backup down")]),
        );
        let interp = interpreter(client.clone(), Arc::new(RecordingObserver::new()));
        let run = Run::new(&wf, "ex-1", vec![]);

        let err = interp.walk(&run, start(&wf, json!("in"))).await.unwrap_err();
        let text = err.to_string();
        assert!(matches!(err, FlowError::FallbackFailed { .. }));
        assert!(text.contains("primary down") && text.contains("backup down"));
        assert_eq!(client.calls_to("backup").len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_node_gets_original_input() {
        let wf = WorkflowDefinition::new("wf", "Fallback node")
            .with_node(
                Node::agent("a", "broken")
                    .with_retries(1, BackoffStrategy::Immediate, 0.0)
                    .with_on_error(ErrorAction::Fallback)
                    .with_fallback_node("rescue"),
            )
            .with_node(Node::agent("rescue", "medic"));
        let client = Arc::new(
            MockAgentClient::new().script("broken", vec![AgentBehavior::fail("nope")]),
        );
        let interp = interpreter(client.clone(), Arc::new(RecordingObserver::new()));
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!("patient"))).await.unwrap();
        assert_eq!(out, json!("patient"));
        assert_eq!(client.calls_to("medic")[0].metadata["input"], json!("patient"));
    }

    #[tokio::test]
    async fn test_unknown_node_is_fatal() {
        let wf = chain("wf", &[("a", "w")]);
        let interp = interpreter(Arc::new(MockAgentClient::new()), Arc::new(RecordingObserver::new()));
        let run = Run::new(&wf, "ex-1", vec![]);

        let cursor = Cursor {
            node_id: "ghost".into(),
            input: json!(null),
            context: ExecutionContext::new(),
        };
        let err = interp.step(&run, cursor).await.unwrap_err();
        assert!(matches!(err, FlowError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_step_limit_stops_cycles() {
        let check = Node::new(
            "check",
            NodeKind::Condition(ConditionNode {
                condition: None,
                conditions: vec![Condition::new("x", Operator::IsEmpty, Value::Null)],
            }),
        );
        let mut wf = WorkflowDefinition::new("wf", "Cycle")
            .with_node(Node::agent("a", "w"))
            .with_node(check)
            .with_edge(Edge::new("a", "check"))
            .with_edge(Edge::branch("check", "a", true));
        wf.start_node = Some("a".into());
        let mut interp = interpreter(Arc::new(MockAgentClient::new()), Arc::new(RecordingObserver::new()));
        interp.config.max_steps = 10;
        let run = Run::new(&wf, "ex-1", vec![]);

        let err = interp.walk(&run, start(&wf, json!("spin"))).await.unwrap_err();
        assert!(err.to_string().contains("step limit"));
        assert_eq!(run.results().len(), 10);
    }
}
