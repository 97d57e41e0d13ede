use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use flowrun_core::context::{lookup_path, ExecutionContext};
use flowrun_core::error::{FlowError, Result};
use flowrun_core::types::{Cursor, ProgressEvent, ProgressStatus};
use flowrun_core::workflow::{LoopNode, LoopType, Node};

use crate::interpreter::{Interpreter, Run};
use crate::oracle;

/// A failed iteration recorded when `break_on_error` is off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationError {
    pub iteration: usize,
    pub error: String,
}

/// Result of a loop node, serialized as the node's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOutcome {
    pub iteration_results: Vec<Value>,
    pub total_iterations: usize,
    pub loop_type: LoopType,
    #[serde(default)]
    pub errors: Vec<IterationError>,
}

impl LoopOutcome {
    fn new(loop_type: LoopType) -> Self {
        Self {
            iteration_results: vec![],
            total_iterations: 0,
            loop_type,
            errors: vec![],
        }
    }
}

impl Interpreter {
    /// Drive a loop node's body under its iteration discipline.
    pub(crate) async fn run_loop(
        &self,
        run: &Run<'_>,
        node: &Node,
        lp: &LoopNode,
        input: &Value,
        context: &ExecutionContext,
    ) -> Result<LoopOutcome> {
        let max = lp
            .max_iterations
            .unwrap_or(self.config.max_loop_iterations) as usize;
        let mut outcome = LoopOutcome::new(lp.loop_type);

        self.emit(
            ProgressEvent::new(&node.id, ProgressStatus::LoopStart)
                .with("loop_type", lp.loop_type.as_str())
                .with("max_iterations", max),
        );

        let Some(body) = run.workflow.loop_body_edge(&node.id).map(|e| e.target.clone()) else {
            warn!(node_id = %node.id, "Loop has no body, nothing to do");
            self.finish_loop(node, &outcome);
            return Ok(outcome);
        };

        match lp.loop_type {
            LoopType::Foreach => {
                let source = match lp.array_path {
                    Some(ref path) => lookup_path(input, path)
                        .cloned()
                        .or_else(|| context.lookup(path)),
                    None => Some(input.clone()),
                };
                let Some(Value::Array(items)) = source else {
                    return Err(FlowError::node(
                        &node.id,
                        format!(
                            "foreach source {} is not an array",
                            lp.array_path.as_deref().unwrap_or("input")
                        ),
                    ));
                };

                for (i, item) in items.into_iter().take(max).enumerate() {
                    let ctx = context.with_loop(&node.id, i, Some(item.clone()));
                    self.iterate(run, node, lp, &body, i, item, ctx, &mut outcome)
                        .await?;
                }
            }
            LoopType::FixedCount => {
                for i in 0..max {
                    let ctx = context.with_loop(&node.id, i, None);
                    self.iterate(run, node, lp, &body, i, input.clone(), ctx, &mut outcome)
                        .await?;
                }
            }
            LoopType::While => {
                let mut current = input.clone();
                for i in 0..max {
                    if !self.loop_condition(lp, &current, context).await? {
                        break;
                    }
                    let ctx = context.with_loop(&node.id, i, None);
                    if let Some(next) = self
                        .iterate(run, node, lp, &body, i, current.clone(), ctx, &mut outcome)
                        .await?
                    {
                        current = next;
                    }
                }
            }
            LoopType::Until => {
                let mut current = input.clone();
                for i in 0..max {
                    let ctx = context.with_loop(&node.id, i, None);
                    let Some(next) = self
                        .iterate(run, node, lp, &body, i, current.clone(), ctx, &mut outcome)
                        .await?
                    else {
                        continue;
                    };
                    current = next;
                    if self.loop_condition(lp, &current, context).await? {
                        break;
                    }
                }
            }
        }

        self.finish_loop(node, &outcome);
        Ok(outcome)
    }

    /// Run one iteration of the body. Returns its output, or `None` when the
    /// iteration failed and the loop keeps going.
    #[allow(clippy::too_many_arguments)]
    async fn iterate(
        &self,
        run: &Run<'_>,
        node: &Node,
        lp: &LoopNode,
        body: &str,
        index: usize,
        input: Value,
        context: ExecutionContext,
        outcome: &mut LoopOutcome,
    ) -> Result<Option<Value>> {
        self.emit(
            ProgressEvent::new(&node.id, ProgressStatus::LoopIteration).with("iteration", index),
        );

        let cursor = Cursor {
            node_id: body.to_string(),
            input,
            context,
        };
        match self.walk(run, cursor).await {
            Ok(output) => {
                outcome.iteration_results.push(output.clone());
                outcome.total_iterations += 1;
                Ok(Some(output))
            }
            Err(e) if lp.break_on_error || e.is_fatal() => {
                self.emit(
                    ProgressEvent::new(&node.id, ProgressStatus::LoopError)
                        .with("iteration", index)
                        .with("error", e.to_string()),
                );
                Err(FlowError::LoopFailed {
                    node_id: node.id.clone(),
                    total_iterations: outcome.total_iterations,
                    message: e.to_string(),
                })
            }
            Err(e) => {
                warn!(node_id = %node.id, iteration = index, error = %e, "Loop iteration failed, continuing");
                self.emit(
                    ProgressEvent::new(&node.id, ProgressStatus::LoopError)
                        .with("iteration", index)
                        .with("error", e.to_string()),
                );
                outcome
                    .iteration_results
                    .push(json!({ "iteration": index, "error": e.to_string() }));
                outcome.errors.push(IterationError {
                    iteration: index,
                    error: e.to_string(),
                });
                outcome.total_iterations += 1;
                Ok(None)
            }
        }
    }

    async fn loop_condition(&self, lp: &LoopNode, current: &Value, context: &ExecutionContext) -> Result<bool> {
        let condition = lp.condition.as_deref().ok_or_else(|| {
            FlowError::InvalidWorkflow(format!("{} loop without a condition", lp.loop_type.as_str()))
        })?;
        let oracle = self
            .oracle
            .as_deref()
            .ok_or_else(|| FlowError::Oracle("no semantic oracle configured".into()))?;
        oracle::decide(oracle, condition, current, &context.to_value()).await
    }

    fn finish_loop(&self, node: &Node, outcome: &LoopOutcome) {
        info!(
            node_id = %node.id,
            total_iterations = outcome.total_iterations,
            errors = outcome.errors.len(),
            "Loop complete"
        );
        self.emit(
            ProgressEvent::new(&node.id, ProgressStatus::LoopComplete)
                .with("total_iterations", outcome.total_iterations),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flowrun_core::traits::SemanticOracle;
    use flowrun_core::workflow::{Edge, NodeKind, WorkflowDefinition};
    use flowrun_test_utils::{AgentBehavior, MockAgentClient, RecordingObserver, ScriptedOracle};

    use crate::interpreter::tests::{interpreter, interpreter_with_oracle};

    fn loop_workflow(lp: LoopNode) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Loop")
            .with_node(Node::new("loop", NodeKind::Loop(lp)))
            .with_node(Node::agent("body", "worker").with_retries(
                1,
                flowrun_core::workflow::BackoffStrategy::Immediate,
                0.0,
            ))
            .with_edge(Edge::loop_body("loop", "body"))
    }

    async fn run_loop_node(
        interp: &Interpreter,
        wf: &WorkflowDefinition,
        input: Value,
    ) -> Result<LoopOutcome> {
        let run = Run::new(wf, "ex-1", vec![]);
        let node = wf.node("loop").unwrap();
        let NodeKind::Loop(ref lp) = node.kind else {
            unreachable!()
        };
        interp
            .run_loop(&run, node, lp, &input, &ExecutionContext::new())
            .await
    }

    fn bounded(loop_type: LoopType, max: u32) -> LoopNode {
        LoopNode {
            max_iterations: Some(max),
            ..LoopNode::new(loop_type)
        }
    }

    #[tokio::test]
    async fn fixed_count_uses_same_input() {
        for k in [1u32, 3, 5] {
            let client = Arc::new(MockAgentClient::new());
            let interp = interpreter(client.clone(), Arc::new(RecordingObserver::new()));
            let wf = loop_workflow(bounded(LoopType::FixedCount, k));

            let outcome = run_loop_node(&interp, &wf, json!("seed")).await.unwrap();
            assert_eq!(outcome.iteration_results.len(), k as usize);
            assert_eq!(outcome.total_iterations, k as usize);
            assert!(client
                .calls()
                .iter()
                .all(|c| c.metadata["input"] == json!("seed")));
        }
    }

    #[tokio::test]
    async fn foreach_truncates_to_bound() {
        let cases = [(5usize, 3u32, 3usize), (2, 10, 2), (0, 4, 0)];
        for (len, max, expected) in cases {
            let client = Arc::new(MockAgentClient::new());
            let observer = Arc::new(RecordingObserver::new());
            let interp = interpreter(client.clone(), observer.clone());
            let wf = loop_workflow(bounded(LoopType::Foreach, max));
            let items: Vec<Value> = (0..len).map(|i| json!(format!("item-{}", i))).collect();

            let outcome = run_loop_node(&interp, &wf, Value::Array(items)).await.unwrap();
            assert_eq!(outcome.total_iterations, expected);
            assert_eq!(observer.count(ProgressStatus::LoopIteration), expected);
            if expected > 0 {
                assert_eq!(outcome.iteration_results[0], json!("item-0"));
                let message = client.calls()[0].message.clone().unwrap();
                assert!(message.contains("\"loop_item\": \"item-0\""));
            }
        }
    }

    #[tokio::test]
    async fn foreach_array_path_and_non_array() {
        let interp = interpreter(Arc::new(MockAgentClient::new()), Arc::new(RecordingObserver::new()));
        let lp = LoopNode {
            array_path: Some("batch.items".into()),
            ..LoopNode::new(LoopType::Foreach)
        };
        let wf = loop_workflow(lp);

        let outcome = run_loop_node(&interp, &wf, json!({ "batch": { "items": [1, 2] } }))
            .await
            .unwrap();
        assert_eq!(outcome.total_iterations, 2);

        let err = run_loop_node(&interp, &wf, json!({ "batch": { "items": "nope" } }))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NodeExecution { .. }));
    }

    #[tokio::test]
    async fn while_threads_output_until_condition_false() {
        let client = Arc::new(MockAgentClient::new().script(
            "worker",
            vec![AgentBehavior::map(|_| "v2".into())],
        ));
        let oracle = Arc::new(ScriptedOracle::decisions(vec![true, true, false]));
        let dyn_oracle: Arc<dyn SemanticOracle> = oracle.clone();
        let interp = interpreter_with_oracle(client.clone(), Arc::new(RecordingObserver::new()), Some(dyn_oracle));
        let lp = LoopNode {
            condition: Some("needs more work".into()),
            ..LoopNode::new(LoopType::While)
        };
        let wf = loop_workflow(lp);

        let outcome = run_loop_node(&interp, &wf, json!("v1")).await.unwrap();
        assert_eq!(outcome.total_iterations, 2);
        assert_eq!(oracle.calls(), 3);
        let inputs: Vec<Value> = client.calls().iter().map(|c| c.metadata["input"].clone()).collect();
        assert_eq!(inputs, vec![json!("v1"), json!("v2")]);
    }

    #[tokio::test]
    async fn until_runs_at_least_once() {
        let oracle: Arc<dyn SemanticOracle> = Arc::new(ScriptedOracle::decisions(vec![true]));
        let interp = interpreter_with_oracle(
            Arc::new(MockAgentClient::new()),
            Arc::new(RecordingObserver::new()),
            Some(oracle),
        );
        let lp = LoopNode {
            condition: Some("looks finished".into()),
            ..LoopNode::new(LoopType::Until)
        };
        let outcome = run_loop_node(&interp, &loop_workflow(lp), json!("x")).await.unwrap();
        assert_eq!(outcome.total_iterations, 1);
    }

    #[tokio::test]
    async fn until_failure_on_second_iteration_reports_one() {
        let client = Arc::new(MockAgentClient::new().script(
            "worker",
            vec![AgentBehavior::reply("first"), AgentBehavior::fail("boom")],
        ));
        let oracle: Arc<dyn SemanticOracle> = Arc::new(ScriptedOracle::decisions(vec![false]));
        let interp = interpreter_with_oracle(client, Arc::new(RecordingObserver::new()), Some(oracle));
        let lp = LoopNode {
            condition: Some("done".into()),
            ..bounded(LoopType::Until, 5)
        };

        let err = run_loop_node(&interp, &loop_workflow(lp), json!("x")).await.unwrap_err();
        match err {
            FlowError::LoopFailed { total_iterations, message, .. } => {
                assert_eq!(total_iterations, 1);
                assert!(message.contains("boom"));
            }
            other => panic!("expected loop failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn continue_on_error_records_markers() {
        let client = Arc::new(MockAgentClient::new().script(
            "worker",
            vec![
                AgentBehavior::reply("a"),
                AgentBehavior::fail("bad"),
                AgentBehavior::reply("c"),
            ],
        ));
        let observer = Arc::new(RecordingObserver::new());
        let interp = interpreter(client, observer.clone());
        let lp = LoopNode {
            break_on_error: false,
            ..bounded(LoopType::FixedCount, 3)
        };

        let outcome = run_loop_node(&interp, &loop_workflow(lp), json!("x")).await.unwrap();
        assert_eq!(outcome.total_iterations, 3);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].iteration, 1);
        assert_eq!(outcome.iteration_results[1]["iteration"], json!(1));
        assert_eq!(outcome.iteration_results[2], json!("c"));
        assert_eq!(observer.count(ProgressStatus::LoopError), 1);
    }

    #[tokio::test]
    async fn missing_body_does_nothing() {
        let interp = interpreter(Arc::new(MockAgentClient::new()), Arc::new(RecordingObserver::new()));
        let wf = WorkflowDefinition::new("wf", "Empty")
            .with_node(Node::new("loop", NodeKind::Loop(bounded(LoopType::FixedCount, 4))));

        let outcome = run_loop_node(&interp, &wf, json!("x")).await.unwrap();
        assert_eq!(outcome.total_iterations, 0);
        assert!(outcome.iteration_results.is_empty());
    }
}
