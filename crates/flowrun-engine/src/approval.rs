use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use flowrun_core::config::ApprovalConfig;
use flowrun_core::context::ExecutionContext;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::{ApprovalStore, ProgressObserver};
use flowrun_core::types::*;
use flowrun_core::workflow::ApprovalNode;

/// In-process approval store that pushes resolutions to waiting gates
/// through oneshot channels.
#[derive(Default)]
pub struct ApprovalBroker {
    records: Mutex<HashMap<String, ApprovalRecord>>,
    watchers: Mutex<HashMap<String, Vec<oneshot::Sender<ApprovalRecord>>>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of gates still waiting on `id`.
    pub async fn watcher_count(&self, id: &str) -> usize {
        self.watchers.lock().await.get(id).map_or(0, Vec::len)
    }
}

impl ApprovalStore for ApprovalBroker {
    fn create(&self, seed: ApprovalSeed) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let id = Uuid::new_v4().to_string();
            let record = ApprovalRecord::from_seed(id.clone(), seed);
            self.records.lock().await.insert(id.clone(), record);
            Ok(id)
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<ApprovalRecord>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.records.lock().await.get(&id).cloned()) })
    }

    fn resolve(&self, id: &str, decision: ApprovalDecision) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let resolved = {
                let mut records = self.records.lock().await;
                let Some(record) = records.get_mut(&id) else {
                    return Ok(false);
                };
                if !record.resolve(decision) {
                    return Ok(false);
                }
                record.clone()
            };

            info!(approval_id = %id, status = resolved.status.as_str(), "Approval resolved");
            let waiting = self.watchers.lock().await.remove(&id).unwrap_or_default();
            for tx in waiting {
                // Ignore send error (the gate may have given up)
                let _ = tx.send(resolved.clone());
            }
            Ok(true)
        })
    }

    fn list_pending(&self) -> BoxFuture<'_, Result<Vec<ApprovalRecord>>> {
        Box::pin(async move {
            let mut pending: Vec<ApprovalRecord> = self
                .records
                .lock()
                .await
                .values()
                .filter(|r| r.status == ApprovalStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by_key(|r| r.created_at);
            Ok(pending)
        })
    }

    fn watch(&self, id: &str) -> BoxFuture<'_, Option<oneshot::Receiver<ApprovalRecord>>> {
        let id = id.to_string();
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            let records = self.records.lock().await;
            let record = records.get(&id)?;
            if record.status != ApprovalStatus::Pending {
                let _ = tx.send(record.clone());
            } else {
                // Registered while the records lock is held, so a concurrent
                // resolve cannot slip in between the check and the insert.
                self.watchers.lock().await.entry(id).or_default().push(tx);
            }
            Some(rx)
        })
    }

    fn unwatch(&self, id: &str) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut watchers = self.watchers.lock().await;
            if let Some(waiting) = watchers.get_mut(&id) {
                waiting.retain(|tx| !tx.is_closed());
                if waiting.is_empty() {
                    watchers.remove(&id);
                }
            }
        })
    }
}

/// Suspends a walk until an approval request leaves `pending`.
pub struct ApprovalGate {
    store: Arc<dyn ApprovalStore>,
    config: ApprovalConfig,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn ApprovalStore>, config: ApprovalConfig) -> Self {
        Self { store, config }
    }

    /// Create an approval request and wait for its decision. Approval yields
    /// the reviewed data, or the original input when the reviewer left it as is.
    pub async fn wait(
        &self,
        node_id: &str,
        execution_id: &str,
        node: &ApprovalNode,
        input: &Value,
        context: &ExecutionContext,
        observer: &dyn ProgressObserver,
    ) -> Result<Value> {
        let id = self
            .store
            .create(ApprovalSeed {
                execution_id: execution_id.to_string(),
                node_id: node_id.to_string(),
                message: node.message.clone(),
                approvers: node.approvers.clone(),
                data: input.clone(),
                context: context.to_value(),
            })
            .await?;

        info!(node_id = %node_id, approval_id = %id, "Waiting for approval");
        let mut event = ProgressEvent::new(node_id, ProgressStatus::WaitingApproval)
            .with("approval_id", id.clone());
        if let Some(ref message) = node.message {
            event = event.with("message", message.clone());
        }
        observer.on_progress(&event);

        let record = self.await_decision(node_id, &id).await?;
        match record.status {
            ApprovalStatus::Approved => {
                observer.on_progress(
                    &ProgressEvent::new(node_id, ProgressStatus::Approved).with("approval_id", id),
                );
                Ok(record.reviewed_data.unwrap_or_else(|| input.clone()))
            }
            _ => Err(FlowError::ApprovalRejected {
                node_id: node_id.to_string(),
                reason: record.reason.unwrap_or_else(|| "no reason given".into()),
            }),
        }
    }

    async fn await_decision(&self, node_id: &str, id: &str) -> Result<ApprovalRecord> {
        let timed_out = || FlowError::ApprovalTimeout {
            node_id: node_id.to_string(),
            attempts: self.config.max_poll_attempts,
        };

        if let Some(rx) = self.store.watch(id).await {
            let waited = tokio::time::timeout(self.config.deadline(), rx).await;
            match waited {
                Ok(Ok(record)) => return Ok(record),
                Ok(Err(_)) => {
                    warn!(approval_id = %id, "Approval watcher dropped, falling back to polling");
                }
                Err(_) => {
                    self.store.unwatch(id).await;
                    return Err(timed_out());
                }
            }
        }

        let attempts = self.config.max_poll_attempts.max(1);
        for attempt in 1..=attempts {
            let record = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| FlowError::Store(format!("approval {} disappeared", id)))?;
            if record.status != ApprovalStatus::Pending {
                return Ok(record);
            }
            debug!(approval_id = %id, attempt, "Approval still pending");
            if attempt < attempts {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
        Err(timed_out())
    }
}
