//! An email channel that posts messages to an HTTP mail relay.

use crate::config::EmailConfig;
use crate::core::{EmailMessage, EmailSender, RecipientOutcome};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, instrument};

/// Sends one relay request per address so each address gets its own outcome.
pub struct HttpEmailSender {
    client: reqwest::Client,
    endpoint: String,
    from_address: String,
    api_key: Option<String>,
    concurrency: usize,
}

impl HttpEmailSender {
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            from_address: config.from_address.clone(),
            api_key: config.api_key.clone(),
            concurrency: config.concurrency.max(1),
        })
    }

    async fn send_one(&self, message: &EmailMessage, address: &str) -> RecipientOutcome {
        let payload = json!({
            "from": self.from_address,
            "to": [address],
            "subject": message.subject,
            "html": message.html_body,
            "text": message.text_body,
        });
        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(res) if res.status().is_success() => RecipientOutcome::sent(address),
            Ok(res) => {
                let status = res.status();
                let text = res.text().await.unwrap_or_default();
                error!(status = %status, body = %text, "Email relay rejected message");
                RecipientOutcome::failed(address, format!("relay returned {}: {}", status, text))
            }
            Err(e) => {
                error!(error = %e, "HTTP request to email relay failed");
                RecipientOutcome::failed(address, e.to_string())
            }
        }
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    fn name(&self) -> &str {
        "http_email"
    }

    #[instrument(skip(self, message, addresses), fields(count = addresses.len()))]
    async fn send(&self, message: &EmailMessage, addresses: &[String]) -> Result<Vec<RecipientOutcome>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let outcomes: Vec<RecipientOutcome> = stream::iter(addresses.iter().cloned())
            .map(|address| async move { self.send_one(message, &address).await })
            .buffered(self.concurrency)
            .collect()
            .await;
        let sent = outcomes.iter().filter(|o| o.is_sent()).count();
        info!(sent, failed = outcomes.len() - sent, "Email batch finished");
        Ok(outcomes)
    }
}
