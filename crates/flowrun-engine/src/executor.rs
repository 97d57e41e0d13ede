//! Top-level driver for one workflow run.
//!
//! Creates the execution record, steps the interpreter from the start node,
//! checkpoints the cursor before every top-level step and writes the terminal
//! state. A run ends exactly completed or failed.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flowrun_core::config::AppConfig;
use flowrun_core::context::ExecutionContext;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::*;
use flowrun_core::types::*;
use flowrun_core::workflow::WorkflowDefinition;

use crate::approval::ApprovalGate;
use crate::interpreter::{Interpreter, Run, Step};
use crate::invocation::AgentInvoker;
use crate::notify::{notify_failure, LogNotifier};
use crate::selector::AgentSelector;

/// External services a run talks to.
pub struct Collaborators {
    pub agents: Arc<dyn AgentClient>,
    pub executions: Arc<dyn ExecutionStore>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub profiles: Arc<dyn ProfileSource>,
    pub oracle: Option<Arc<dyn SemanticOracle>>,
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub observer: Arc<dyn ProgressObserver>,
}

/// A completed run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: ExecutionId,
    pub output: Value,
}

pub struct WorkflowExecutor {
    interpreter: Interpreter,
    executions: Arc<dyn ExecutionStore>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    notifier: Arc<dyn Notifier>,
}

impl WorkflowExecutor {
    pub fn new(config: &AppConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            agents,
            executions,
            approvals,
            profiles,
            oracle,
            checkpoints,
            notifier,
            observer,
        } = collaborators;

        let interpreter = Interpreter::new(
            config.engine.clone(),
            AgentInvoker::new(agents, &config.agent_client),
            AgentSelector::new(profiles, oracle.clone()),
            ApprovalGate::new(approvals, config.approval.clone()),
            oracle,
            observer,
        );

        Self {
            interpreter,
            executions,
            checkpoints,
            notifier: notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
        }
    }

    /// Run a workflow to completion.
    pub async fn run(&self, workflow: &WorkflowDefinition, input: Value) -> Result<ExecutionOutcome> {
        self.run_until_cancelled(workflow, input, CancellationToken::new())
            .await
    }

    /// Run a workflow until it terminates or `cancel` fires. Cancellation
    /// fails the run with `Cancelled`.
    pub async fn run_until_cancelled(
        &self,
        workflow: &WorkflowDefinition,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        workflow.validate()?;
        let start = workflow.start()?;

        let execution_id = self
            .executions
            .create(ExecutionSeed::for_workflow(workflow, input.clone()))
            .await?;
        info!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            start_node = %start.id,
            "Starting workflow"
        );

        let cursor = Cursor {
            node_id: start.id.clone(),
            input,
            context: ExecutionContext::from_variables(workflow.variables.clone()),
        };
        self.drive(workflow, &execution_id, cursor, 0, vec![], cancel)
            .await
    }

    /// Continue an interrupted run from its last checkpoint.
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionOutcome> {
        self.resume_until_cancelled(execution_id, CancellationToken::new())
            .await
    }

    pub async fn resume_until_cancelled(
        &self,
        execution_id: &str,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let checkpoints = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| FlowError::Config("checkpointing is not configured".into()))?;
        let checkpoint = checkpoints
            .load(execution_id)
            .await?
            .ok_or_else(|| FlowError::Store(format!("no checkpoint for execution {}", execution_id)))?;

        let id = ExecutionId::from_str(execution_id);
        if let Some(record) = self.executions.get(&id).await? {
            if record.status != ExecutionStatus::Running {
                return Err(FlowError::Store(format!(
                    "execution {} already {}",
                    execution_id,
                    record.status.as_str()
                )));
            }
        }

        info!(
            execution_id = %execution_id,
            node_id = %checkpoint.cursor.node_id,
            step = checkpoint.step,
            "Resuming workflow"
        );
        self.drive(
            &checkpoint.workflow,
            &id,
            checkpoint.cursor,
            checkpoint.step,
            checkpoint.step_results,
            cancel,
        )
        .await
    }

    async fn drive(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: &ExecutionId,
        cursor: Cursor,
        first_step: usize,
        results: Vec<StepResult>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let run = Run::new(workflow, &execution_id.0, results);
        let mut step = first_step;

        let walked = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(execution_id = %execution_id, "Execution cancelled");
                Err(FlowError::Cancelled)
            }
            result = self.step_until_done(&run, cursor, &mut step) => result,
        };

        self.finish(&run, execution_id, step, walked).await
    }

    async fn step_until_done(&self, run: &Run<'_>, mut cursor: Cursor, step: &mut usize) -> Result<Value> {
        let max_steps = self.interpreter.config().max_steps as usize;
        loop {
            if *step >= max_steps {
                return Err(FlowError::node(
                    &cursor.node_id,
                    format!("step limit of {} exceeded", max_steps),
                ));
            }
            self.checkpoint(run, &cursor, *step).await;
            let next = self.interpreter.step(run, cursor).await?;
            *step += 1;
            match next {
                Step::Next(c) => cursor = c,
                Step::Done(output) => return Ok(output),
            }
        }
    }

    async fn checkpoint(&self, run: &Run<'_>, cursor: &Cursor, step: usize) {
        let Some(ref store) = self.checkpoints else {
            return;
        };
        let checkpoint = Checkpoint {
            execution_id: run.execution_id.to_string(),
            workflow: run.workflow.clone(),
            cursor: cursor.clone(),
            step,
            step_results: run.results(),
            timestamp: Utc::now(),
        };
        if let Err(e) = store.save(&checkpoint).await {
            warn!(execution_id = %run.execution_id, error = %e, "Failed to save checkpoint");
        }
    }

    async fn finish(
        &self,
        run: &Run<'_>,
        execution_id: &ExecutionId,
        step: usize,
        walked: Result<Value>,
    ) -> Result<ExecutionOutcome> {
        let results = run.results();

        // A completion the store refused is a failed run.
        let walked = match walked {
            Ok(output) => self
                .executions
                .update(
                    execution_id,
                    ExecutionUpdate {
                        status: Some(ExecutionStatus::Completed),
                        current_step: Some(step),
                        step_results: Some(results.clone()),
                        output: Some(output.clone()),
                        finished_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await
                .map(|()| output),
            Err(e) => Err(e),
        };

        let outcome = match walked {
            Ok(output) => {
                info!(execution_id = %execution_id, steps = step, "Workflow completed");
                Ok(ExecutionOutcome {
                    execution_id: execution_id.clone(),
                    output,
                })
            }
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "Workflow failed");
                let update = ExecutionUpdate {
                    status: Some(ExecutionStatus::Failed),
                    current_step: Some(step),
                    step_results: Some(results),
                    error: Some(e.to_string()),
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                };
                if let Err(store_err) = self.executions.update(execution_id, update).await {
                    warn!(execution_id = %execution_id, error = %store_err, "Failed to record failure");
                }
                notify_failure(self.notifier.as_ref(), run.workflow, run.execution_id, &e.to_string())
                    .await;
                Err(e)
            }
        };

        if let Some(ref store) = self.checkpoints {
            if let Err(e) = store.delete(run.execution_id).await {
                warn!(execution_id = %execution_id, error = %e, "Failed to delete checkpoint");
            }
        }
        outcome
    }
}
