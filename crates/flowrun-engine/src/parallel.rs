use futures::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use flowrun_core::context::{value_text, ExecutionContext};
use flowrun_core::error::Result;
use flowrun_core::types::Cursor;
use flowrun_core::workflow::Node;

use crate::interpreter::{Interpreter, Run};

impl Interpreter {
    /// Walk every outgoing branch concurrently and join their outputs as text.
    ///
    /// Each branch starts from the same input and context snapshot. All
    /// branches are awaited before the first failure (in edge order) is
    /// reported.
    pub(crate) async fn run_parallel(
        &self,
        run: &Run<'_>,
        node: &Node,
        input: &Value,
        context: &ExecutionContext,
    ) -> Result<Value> {
        let targets: Vec<String> = run
            .workflow
            .outgoing(&node.id)
            .map(|e| e.target.clone())
            .collect();
        if targets.is_empty() {
            warn!(node_id = %node.id, "Parallel node has no branches");
            return Ok(input.clone());
        }

        info!(node_id = %node.id, branches = targets.len(), "Starting parallel branches");
        let walks = targets.into_iter().map(|target| {
            self.walk(
                run,
                Cursor {
                    node_id: target,
                    input: input.clone(),
                    context: context.clone(),
                },
            )
        });

        let outputs = join_all(walks)
            .await
            .into_iter()
            .collect::<Result<Vec<Value>>>()?;
        let joined = outputs
            .iter()
            .map(value_text)
            .collect::<Vec<_>>()
            .join(&self.config.parallel_separator);
        Ok(Value::String(joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use flowrun_core::error::FlowError;
    use flowrun_core::workflow::{BackoffStrategy, Edge, NodeKind, WorkflowDefinition};
    use flowrun_test_utils::{AgentBehavior, MockAgentClient, RecordingObserver};
    use serde_json::json;

    use crate::interpreter::tests::{interpreter, start};

    fn fan_out(branches: &[(&str, &str)]) -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new("wf", "Fan out")
            .with_node(Node::new("split", NodeKind::Parallel));
        for (id, worker) in branches {
            wf = wf
                .with_node(Node::agent(*id, *worker).with_retries(1, BackoffStrategy::Immediate, 0.0))
                .with_edge(Edge::new("split", *id));
        }
        wf
    }

    #[tokio::test]
    async fn joins_in_edge_order() {
        let client = Arc::new(
            MockAgentClient::new()
                .script("a", vec![AgentBehavior::reply("alpha")])
                .script("b", vec![AgentBehavior::reply("beta")])
                .script("c", vec![AgentBehavior::reply("gamma")]),
        );
        let mut interp = interpreter(client, Arc::new(RecordingObserver::new()));
        interp.config.parallel_separator = " | ".into();
        let wf = fan_out(&[("x", "a"), ("y", "b"), ("z", "c")]);
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!("in"))).await.unwrap();
        assert_eq!(out, json!("alpha | beta | gamma"));
        // parallel node plus three branches
        assert_eq!(run.results().len(), 4);
    }

    #[tokio::test]
    async fn default_separator() {
        let client = Arc::new(
            MockAgentClient::new()
                .script("a", vec![AgentBehavior::reply("one")])
                .script("b", vec![AgentBehavior::reply("two")]),
        );
        let interp = interpreter(client, Arc::new(RecordingObserver::new()));
        let wf = fan_out(&[("x", "a"), ("y", "b")]);
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!("in"))).await.unwrap();
        assert_eq!(out, json!("one\n\n---\n\ntwo"));
    }

    #[tokio::test]
    async fn failure_waits_for_siblings() {
        let client = Arc::new(
            MockAgentClient::new()
                .script("slow", vec![AgentBehavior::map(|_| {
                    std::thread::sleep(Duration::from_millis(20));
                    "late".into()
                })])
                .script("bad", vec![AgentBehavior::fail("branch broke")]),
        );
        let interp = interpreter(client.clone(), Arc::new(RecordingObserver::new()));
        let wf = fan_out(&[("x", "slow"), ("y", "bad")]);
        let run = Run::new(&wf, "ex-1", vec![]);

        let err = interp.walk(&run, start(&wf, json!("in"))).await.unwrap_err();
        assert!(matches!(err, FlowError::NodeExecution { .. }));
        assert!(err.to_string().contains("branch broke"));
        assert_eq!(client.calls_to("slow").len(), 1);
        assert!(run.results().iter().any(|r| r.node_id == "x" && r.status == "completed"));
    }

    #[tokio::test]
    async fn siblings_do_not_see_each_other() {
        let client = Arc::new(
            MockAgentClient::new()
                .script("a", vec![AgentBehavior::reply("from-a")])
                .script("b", vec![AgentBehavior::reply("from-b")]),
        );
        let interp = interpreter(client.clone(), Arc::new(RecordingObserver::new()));
        let wf = fan_out(&[("x", "a"), ("y", "b")])
            .with_node(Node::agent("x2", "peek-a"))
            .with_node(Node::agent("y2", "peek-b"))
            .with_edge(Edge::new("x", "x2"))
            .with_edge(Edge::new("y", "y2"));
        let run = Run::new(&wf, "ex-1", vec![]);

        interp.walk(&run, start(&wf, json!("in"))).await.unwrap();
        let peek_a = client.calls_to("peek-a")[0].message.clone().unwrap();
        let peek_b = client.calls_to("peek-b")[0].message.clone().unwrap();
        assert!(peek_a.contains("from-a") && !peek_a.contains("from-b"));
        assert!(peek_b.contains("from-b") && !peek_b.contains("from-a"));
    }

    #[tokio::test]
    async fn no_branches_passes_input_through() {
        let interp = interpreter(Arc::new(MockAgentClient::new()), Arc::new(RecordingObserver::new()));
        let wf = fan_out(&[]);
        let run = Run::new(&wf, "ex-1", vec![]);

        let out = interp.walk(&run, start(&wf, json!({ "k": 1 }))).await.unwrap();
        assert_eq!(out, json!({ "k": 1 }));
    }
}
