use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::types::AgentProfile;
use crate::workflow::BackoffStrategy;

/// Top-level flowrun configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agent_client: AgentClientConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub oracle: Option<OracleConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
    /// Worker profiles consulted by dynamic agent selection.
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

/// Interpreter defaults, used when neither the node nor the workflow says otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub default_backoff: BackoffStrategy,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
    #[serde(default = "default_parallel_separator")]
    pub parallel_separator: String,
    /// Upper bound on nodes visited by a single walk, guarding cyclic graphs.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            default_backoff: BackoffStrategy::default(),
            base_delay_secs: default_base_delay(),
            agent_timeout_secs: default_agent_timeout(),
            max_loop_iterations: default_max_loop_iterations(),
            parallel_separator: default_parallel_separator(),
            max_steps: default_max_steps(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_base_delay() -> f64 { 1.0 }
fn default_agent_timeout() -> u64 { 300 }
fn default_max_loop_iterations() -> u32 { 100 }
fn default_parallel_separator() -> String { "\n\n---\n\n".to_string() }
fn default_max_steps() -> u32 { 1000 }

/// External worker service and response polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentClientConfig {
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_agent_base_url(),
            api_key: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl AgentClientConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_agent_base_url() -> String { "http://127.0.0.1:8700".to_string() }
fn default_poll_interval_ms() -> u64 { 2000 }
fn default_max_poll_attempts() -> u32 { 60 }

/// Approval gate polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_poll_secs")]
    pub poll_interval_secs: f64,
    #[serde(default = "default_approval_attempts")]
    pub max_poll_attempts: u32,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_approval_poll_secs(),
            max_poll_attempts: default_approval_attempts(),
        }
    }
}

impl ApprovalConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs.max(0.0))
    }

    /// Total time a gate waits before giving up.
    pub fn deadline(&self) -> Duration {
        self.poll_interval() * self.max_poll_attempts
    }
}

fn default_approval_poll_secs() -> f64 { 5.0 }
fn default_approval_attempts() -> u32 { 300 }

/// Semantic oracle model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for oracle requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Record store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.flowrun/flowrun.db".to_string() }

/// Failure notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Resolve the store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let path = &self.store.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWRUN_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWRUN_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWRUN_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLOWRUN_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLOWRUN_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.default_max_retries, 3);
        assert_eq!(config.engine.default_backoff, BackoffStrategy::ExponentialBackoff);
        assert_eq!(config.engine.agent_timeout_secs, 300);
        assert_eq!(config.engine.max_loop_iterations, 100);
        assert_eq!(config.agent_client.poll_interval_ms, 2000);
        assert_eq!(config.agent_client.max_poll_attempts, 60);
        assert_eq!(config.approval.max_poll_attempts, 300);
        assert!(config.oracle.is_none());
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_approval_deadline() {
        let approval = ApprovalConfig::default();
        assert_eq!(approval.deadline(), Duration::from_secs(1500));
    }

    #[test]
    fn test_agent_profiles_section() {
        let toml_str = r#"
[[agents]]
name = "researcher"
skills = ["search", "summarize"]
success_rate = 0.9
active_tasks = 2

[[agents]]
name = "coder"
skills = ["rust"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].skills, vec!["search", "summarize"]);
        assert_eq!(config.agents[1].success_rate, 0.0);
    }
}
