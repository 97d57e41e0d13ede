use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use flowrun_core::config::AgentClientConfig;
use flowrun_core::context::{value_text, ExecutionContext};
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::AgentClient;
use flowrun_core::types::ConversationHandle;

/// One unit of work for an external worker.
#[derive(Debug, Clone)]
pub struct AgentTask<'a> {
    pub node_id: &'a str,
    pub execution_id: &'a str,
    pub worker: &'a str,
    pub message: String,
    pub input: &'a Value,
    pub timeout: Duration,
}

/// Merge static instructions with the current input and context.
pub fn build_task_message(instructions: &str, input: &Value, ctx: &ExecutionContext) -> String {
    let mut message = String::new();
    if !instructions.trim().is_empty() {
        message.push_str(instructions.trim());
        message.push_str("\n\n");
    }
    message.push_str("Input:\n");
    message.push_str(&value_text(input));

    let context = ctx.to_value();
    if context.as_object().is_some_and(|m| !m.is_empty()) {
        message.push_str("\n\nContext:\n");
        message.push_str(&serde_json::to_string_pretty(&context).unwrap_or_default());
    }
    message
}

/// Drives a worker conversation to a reply: create, send, then poll.
pub struct AgentInvoker {
    client: Arc<dyn AgentClient>,
    poll_interval: Duration,
    max_polls: u32,
}

impl AgentInvoker {
    pub fn new(client: Arc<dyn AgentClient>, config: &AgentClientConfig) -> Self {
        Self {
            client,
            poll_interval: config.poll_interval(),
            max_polls: config.max_poll_attempts.max(1),
        }
    }

    /// Invoke a worker under a hard deadline. When the deadline wins, the
    /// conversation (if one was opened) is cancelled best-effort.
    pub async fn invoke(&self, task: AgentTask<'_>) -> Result<String> {
        let opened: Mutex<Option<ConversationHandle>> = Mutex::new(None);
        let metadata = json!({
            "node_id": task.node_id,
            "execution_id": task.execution_id,
            "input": task.input,
        });

        let work = async {
            let handle = self.client.create(task.worker, metadata).await?;
            if let Ok(mut slot) = opened.lock() {
                *slot = Some(handle.clone());
            }
            debug!(worker = %task.worker, conversation = %handle, "Conversation opened");
            self.client.send(&handle, &task.message).await?;
            self.await_reply(task.worker, &handle).await
        };

        let outcome = match tokio::time::timeout(task.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    node_id = %task.node_id,
                    worker = %task.worker,
                    timeout_secs = task.timeout.as_secs_f64(),
                    "Agent invocation timed out"
                );
                Err(FlowError::Timeout {
                    node_id: task.node_id.to_string(),
                    timeout_secs: task.timeout.as_secs(),
                })
            }
        };

        if matches!(outcome, Err(FlowError::Timeout { .. }) | Err(FlowError::ResponseTimeout { .. })) {
            let handle = opened.lock().ok().and_then(|mut slot| slot.take());
            if let Some(handle) = handle {
                if let Err(e) = self.client.cancel(&handle).await {
                    warn!(conversation = %handle, error = %e, "Failed to cancel conversation");
                }
            }
        }

        outcome.map_err(|e| match e {
            FlowError::Agent { worker, message } => {
                FlowError::node(task.node_id, format!("{}: {}", worker, message))
            }
            other => other,
        })
    }

    async fn await_reply(&self, worker: &str, handle: &ConversationHandle) -> Result<String> {
        for attempt in 1..=self.max_polls {
            if let Some(reply) = self.client.poll(handle).await? {
                info!(worker = %worker, attempt, "Worker replied");
                return Ok(reply);
            }
            if attempt < self.max_polls {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Err(FlowError::ResponseTimeout {
            worker: worker.to_string(),
            attempts: self.max_polls,
        })
    }
}
