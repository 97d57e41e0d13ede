pub mod http_agent;
pub mod openai;
pub mod retry;
pub mod webhook;

use std::sync::Arc;

use flowrun_core::config::OracleConfig;
use flowrun_core::traits::SemanticOracle;

pub use http_agent::HttpAgentClient;
pub use openai::OpenAiOracle;
pub use retry::RetryingOracle;
pub use webhook::WebhookNotifier;

/// Create the semantic oracle for a configured model.
///
/// Every provider is reached through the OpenAI-compatible API; a `retry`
/// section wraps the client in backoff.
pub fn create_oracle(config: &OracleConfig) -> Arc<dyn SemanticOracle> {
    let client = OpenAiOracle::new(config.clone());
    match config.retry {
        Some(ref retry) => Arc::new(RetryingOracle::new(Box::new(client), retry.clone())),
        None => Arc::new(client),
    }
}
