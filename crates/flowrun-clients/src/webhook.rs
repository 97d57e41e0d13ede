use futures::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use flowrun_core::config::NotifyConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::Notifier;

#[derive(Serialize)]
struct WebhookPayload<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Delivers failure notifications by POSTing JSON to a webhook, which
/// relays them to mail, chat or paging.
pub struct WebhookNotifier {
    http: Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            http: Client::new(),
            url: config.webhook_url.clone(),
            token: config.token.clone(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, address: &str, subject: &str, body: &str) -> BoxFuture<'_, Result<()>> {
        let request = self.http.post(&self.url).json(&WebhookPayload {
            to: address,
            subject,
            body,
        });
        let request = match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        };
        let address = address.to_string();

        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|e| FlowError::Store(format!("webhook delivery failed: {}", e)))?;
            if !response.status().is_success() {
                return Err(FlowError::Store(format!(
                    "webhook rejected notification for {}: HTTP {}",
                    address,
                    response.status()
                )));
            }
            debug!(address = %address, "Notification delivered");
            Ok(())
        })
    }
}
