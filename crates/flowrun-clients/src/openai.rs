use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use flowrun_core::config::OracleConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::SemanticOracle;
use flowrun_core::types::OracleRequest;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

const SYSTEM_PROMPT: &str = "You are a precise evaluator inside a workflow engine. \
     Answer with a single JSON object and nothing else.";

/// Semantic oracle over an OpenAI-compatible chat completions endpoint.
/// Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiOracle {
    http: Client,
    config: OracleConfig,
}

impl OpenAiOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    response_format: Value,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Extract JSON from a model reply (handles markdown code blocks).
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

impl SemanticOracle for OpenAiOracle {
    fn evaluate(&self, request: OracleRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let body = ChatRequest {
                model: &self.config.model_id,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: format!(
                            "{}\nThe object must match this JSON schema:\n{}",
                            SYSTEM_PROMPT, request.schema
                        ),
                    },
                    ChatMessage {
                        role: "user",
                        content: request.prompt,
                    },
                ],
                max_tokens: self.config.max_tokens,
                temperature: (self.config.temperature > 0.0).then_some(self.config.temperature),
                response_format: json!({ "type": "json_object" }),
            };

            let mut req = self.http.post(url).json(&body);
            if let Some(ref api_key) = self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| FlowError::Oracle(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(FlowError::Oracle(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| FlowError::Oracle(format!("malformed response: {}", e)))?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| FlowError::Oracle("empty completion".into()))?;

            debug!(model = %self.config.model_id, reply = %content, "Oracle replied");
            serde_json::from_str(extract_json(&content)).map_err(|e| {
                FlowError::Oracle(format!("reply is not JSON ({}): {}", e, content))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> OracleConfig {
        OracleConfig {
            provider: "openai".into(),
            model_id: "gpt-4o-mini".into(),
            api_key: None,
            base_url: Some(base_url),
            max_tokens: 256,
            temperature: 0.0,
            retry: None,
        }
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("Sure: {\"a\": 1} hope that helps"), "{\"a\": 1}");
        assert_eq!(extract_json("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[tokio::test]
    async fn test_evaluate_parses_fenced_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "model": "gpt-4o-mini" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "```json\n{\"decision\": true, \"reasoning\": \"fine\"}\n```"
                    }
                }]
            })))
            .mount(&server)
            .await;

        let oracle = OpenAiOracle::new(config(format!("{}/v1/chat/completions", server.uri())));
        let verdict = oracle
            .evaluate(OracleRequest {
                prompt: "Is it fine?".into(),
                schema: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(verdict["decision"], json!(true));
    }

    #[tokio::test]
    async fn test_http_error_is_oracle_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let oracle = OpenAiOracle::new(config(server.uri()));
        let err = oracle
            .evaluate(OracleRequest {
                prompt: "?".into(),
                schema: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Oracle(ref m) if m.contains("429")));
    }
}
