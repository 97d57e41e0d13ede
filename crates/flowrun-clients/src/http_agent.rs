use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use flowrun_core::config::AgentClientConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::AgentClient;
use flowrun_core::types::ConversationHandle;

#[derive(Serialize)]
struct CreateRequest<'a> {
    agent: &'a str,
    metadata: Value,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Serialize)]
struct MessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct LatestMessage {
    role: String,
    #[serde(default)]
    content: String,
}

/// Agent client for a REST conversation service.
///
/// - `POST /conversations` opens a conversation with `{agent, metadata}`
/// - `POST /conversations/{id}/messages` sends a user message
/// - `GET /conversations/{id}/messages/latest` returns the newest message;
///   only an assistant message counts as a reply
/// - `DELETE /conversations/{id}` abandons it
pub struct HttpAgentClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    workers: Mutex<HashMap<String, String>>,
}

impl HttpAgentClient {
    pub fn new(config: &AgentClientConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    fn worker_of(&self, handle: &ConversationHandle) -> String {
        self.workers
            .lock()
            .ok()
            .and_then(|w| w.get(&handle.0).cloned())
            .unwrap_or_else(|| format!("conversation {}", handle))
    }

    async fn send_checked(&self, worker: &str, req: RequestBuilder) -> Result<reqwest::Response> {
        let agent_err = |message: String| FlowError::Agent {
            worker: worker.to_string(),
            message,
        };
        let response = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| agent_err(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(agent_err(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

impl AgentClient for HttpAgentClient {
    fn create(&self, worker: &str, metadata: Value) -> BoxFuture<'_, Result<ConversationHandle>> {
        let worker = worker.to_string();
        Box::pin(async move {
            let req = self.http.post(self.url("/conversations")).json(&CreateRequest {
                agent: &worker,
                metadata,
            });
            let created: CreateResponse = self
                .send_checked(&worker, req)
                .await?
                .json()
                .await
                .map_err(|e| FlowError::Agent {
                    worker: worker.clone(),
                    message: format!("malformed create response: {}", e),
                })?;

            debug!(worker = %worker, conversation = %created.id, "Conversation created");
            if let Ok(mut workers) = self.workers.lock() {
                workers.insert(created.id.clone(), worker);
            }
            Ok(ConversationHandle(created.id))
        })
    }

    fn send(&self, handle: &ConversationHandle, message: &str) -> BoxFuture<'_, Result<()>> {
        let handle = handle.clone();
        let message = message.to_string();
        Box::pin(async move {
            let worker = self.worker_of(&handle);
            let req = self
                .http
                .post(self.url(&format!("/conversations/{}/messages", handle)))
                .json(&MessageRequest {
                    role: "user",
                    content: &message,
                });
            self.send_checked(&worker, req).await?;
            Ok(())
        })
    }

    fn poll(&self, handle: &ConversationHandle) -> BoxFuture<'_, Result<Option<String>>> {
        let handle = handle.clone();
        Box::pin(async move {
            let worker = self.worker_of(&handle);
            let req = self
                .http
                .get(self.url(&format!("/conversations/{}/messages/latest", handle)));
            let response = self.send_checked(&worker, req).await?;
            if response.status() == StatusCode::NO_CONTENT {
                return Ok(None);
            }

            let latest: Option<LatestMessage> =
                response.json().await.map_err(|e| FlowError::Agent {
                    worker: worker.clone(),
                    message: format!("malformed message: {}", e),
                })?;
            Ok(latest
                .filter(|m| m.role == "assistant" && !m.content.is_empty())
                .map(|m| m.content))
        })
    }

    fn cancel(&self, handle: &ConversationHandle) -> BoxFuture<'_, Result<()>> {
        let handle = handle.clone();
        Box::pin(async move {
            let worker = self.worker_of(&handle);
            let req = self.http.delete(self.url(&format!("/conversations/{}", handle)));
            self.send_checked(&worker, req).await?;
            if let Ok(mut workers) = self.workers.lock() {
                workers.remove(&handle.0);
            }
            Ok(())
        })
    }
}
