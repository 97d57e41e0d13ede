use futures::future::BoxFuture;
use tracing::{info, warn};

use flowrun_core::error::Result;
use flowrun_core::traits::Notifier;
use flowrun_core::workflow::WorkflowDefinition;

/// Notifier that only writes to the log. Used when no delivery channel is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, address: &str, subject: &str, body: &str) -> BoxFuture<'_, Result<()>> {
        info!(address = %address, subject = %subject, body = %body, "Failure notification");
        Box::pin(async { Ok(()) })
    }
}

/// Tell every address on the workflow's failure list that a run failed.
/// Delivery problems are logged and never change the run's outcome.
pub async fn notify_failure(
    notifier: &dyn Notifier,
    workflow: &WorkflowDefinition,
    execution_id: &str,
    error: &str,
) {
    if workflow.notify_on_failure.is_empty() {
        return;
    }

    let subject = format!("Workflow failed: {}", workflow.name);
    let body = format!(
        "Workflow \"{}\" ({}) failed.\n\nExecution: {}\nError: {}",
        workflow.name, workflow.id, execution_id, error
    );

    for address in &workflow.notify_on_failure {
        if let Err(e) = notifier.notify(address, &subject, &body).await {
            warn!(address = %address, error = %e, "Failed to deliver failure notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_test_utils::RecordingNotifier;

    fn workflow(addresses: &[&str]) -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new("wf-1", "Nightly report");
        wf.notify_on_failure = addresses.iter().map(|a| a.to_string()).collect();
        wf
    }

    #[tokio::test]
    async fn sends_one_per_address() {
        let notifier = RecordingNotifier::new();
        notify_failure(&notifier, &workflow(&["ops@example.com", "lead@example.com"]), "ex-9", "boom")
            .await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].address, "ops@example.com");
        assert_eq!(sent[0].subject, "Workflow failed: Nightly report");
        assert!(sent[1].body.contains("ex-9") && sent[1].body.contains("boom"));
    }

    #[tokio::test]
    async fn delivery_errors_are_swallowed() {
        let notifier = RecordingNotifier::failing();
        notify_failure(&notifier, &workflow(&["a@x", "b@x"]), "ex-1", "boom").await;
        // both attempted even though the first failed
        assert_eq!(notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn empty_list_sends_nothing() {
        let notifier = RecordingNotifier::new();
        notify_failure(&notifier, &workflow(&[]), "ex-1", "boom").await;
        assert!(notifier.sent().is_empty());
    }
}
