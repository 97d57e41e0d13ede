use std::future::Future;
use std::time::Duration;

use tracing::warn;

use flowrun_core::config::EngineConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::workflow::{BackoffStrategy, Node, WorkflowDefinition};

/// Longest single wait between attempts.
const MAX_DELAY_SECS: f64 = 3600.0;

/// Delay before the attempt following `attempt` (0-based).
pub fn delay(strategy: BackoffStrategy, attempt: u32, base_secs: f64) -> Duration {
    let secs = match strategy {
        BackoffStrategy::ExponentialBackoff => base_secs * 2f64.powi(attempt.min(30) as i32),
        BackoffStrategy::FixedDelay => base_secs,
        BackoffStrategy::Immediate => 0.0,
    };
    Duration::from_secs_f64(secs.clamp(0.0, MAX_DELAY_SECS))
}

/// Effective retry settings for one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_secs: f64,
}

impl RetryPolicy {
    /// Node settings win over the workflow's, which win over the engine defaults.
    pub fn resolve(node: &Node, workflow: &WorkflowDefinition, engine: &EngineConfig) -> Self {
        let policy = &workflow.error_handling;
        Self {
            max_attempts: node
                .max_retries
                .or(policy.max_retries)
                .unwrap_or(engine.default_max_retries)
                .max(1),
            strategy: node
                .retry_strategy
                .or(policy.retry_strategy)
                .unwrap_or(engine.default_backoff),
            base_delay_secs: node
                .retry_delay_secs
                .or(policy.retry_delay_secs)
                .unwrap_or(engine.base_delay_secs),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        delay(self.strategy, attempt, self.base_delay_secs)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `on_retry(next_attempt, error, wait)` fires
    /// before each wait.
    pub async fn run<T, F, Fut>(
        &self,
        mut op: F,
        mut on_retry: impl FnMut(u32, &FlowError, Duration),
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let wait = self.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying node"
                    );
                    on_retry(attempt + 2, &e, wait);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
