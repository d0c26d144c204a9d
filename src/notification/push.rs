//! A push channel for the Expo push service.

use crate::config::PushConfig;
use crate::core::{PushMessage, PushSender, RecipientOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Provider error code for tokens that will never be deliverable again.
const DEVICE_NOT_REGISTERED: &str = "DeviceNotRegistered";

/// The provider never accepts more than this many messages per request.
pub const MAX_PUSH_BATCH: usize = 100;

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    data: Vec<PushTicket>,
}

#[derive(Debug, Deserialize)]
struct PushTicket {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<TicketDetails>,
}

#[derive(Debug, Deserialize)]
struct TicketDetails {
    #[serde(default)]
    error: Option<String>,
}

pub struct ExpoPushSender {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
    batch_size: usize,
    concurrency: usize,
}

impl ExpoPushSender {
    /// `timeout` bounds each provider request on its own.
    pub fn new(config: &PushConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            access_token: config.access_token.clone(),
            batch_size: config.batch_size.clamp(1, MAX_PUSH_BATCH),
            concurrency: config.concurrency.max(1),
        })
    }

    /// Sends one provider-sized chunk and maps each ticket to an outcome.
    async fn send_chunk(&self, message: &PushMessage, tokens: &[String]) -> Result<Vec<RecipientOutcome>> {
        let payload: Vec<Value> = tokens
            .iter()
            .map(|token| {
                json!({
                    "to": token,
                    "title": message.title,
                    "body": message.body,
                    "data": message.data,
                    "sound": "default",
                })
            })
            .collect();

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let res = request.send().await.context("push request failed")?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            anyhow::bail!("push service returned {}: {}", status, text);
        }
        let response: PushResponse = res.json().await.context("invalid push service response")?;

        let outcomes = tokens
            .iter()
            .enumerate()
            .map(|(i, token)| match response.data.get(i) {
                Some(ticket) if ticket.status == "ok" => RecipientOutcome::sent(token.as_str()),
                Some(ticket) => {
                    let code = ticket.details.as_ref().and_then(|d| d.error.as_deref());
                    let reason = ticket
                        .message
                        .clone()
                        .or_else(|| code.map(str::to_string))
                        .unwrap_or_else(|| "push rejected".to_string());
                    if code == Some(DEVICE_NOT_REGISTERED) {
                        RecipientOutcome::unregistered(token.as_str(), reason)
                    } else {
                        RecipientOutcome::failed(token.as_str(), reason)
                    }
                }
                None => RecipientOutcome::failed(token.as_str(), "no ticket returned for token"),
            })
            .collect();
        Ok(outcomes)
    }
}

#[async_trait]
impl PushSender for ExpoPushSender {
    fn name(&self) -> &str {
        "expo_push"
    }

    #[instrument(skip(self, message, tokens), fields(count = tokens.len()))]
    async fn send(&self, message: &PushMessage, tokens: &[String]) -> Result<Vec<RecipientOutcome>> {
        // Chunks run concurrently; `buffered` keeps outcomes in token order.
        let chunked: Vec<Vec<RecipientOutcome>> = stream::iter(tokens.chunks(self.batch_size).map(<[String]>::to_vec))
            .map(|chunk| async move {
                match self.send_chunk(message, &chunk).await {
                    Ok(outcomes) => outcomes,
                    Err(e) => {
                        // A failed chunk fails only its own tokens.
                        let reason = format!("{:#}", e);
                        error!(error = %reason, size = chunk.len(), "Push chunk failed");
                        chunk
                            .iter()
                            .map(|t| RecipientOutcome::failed(t.as_str(), reason.clone()))
                            .collect()
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;
        let outcomes: Vec<RecipientOutcome> = chunked.into_iter().flatten().collect();
        let unregistered = outcomes.iter().filter(|o| o.unregistered).count();
        if unregistered > 0 {
            warn!(unregistered, "Push service reported unregistered devices");
        }
        info!(
            sent = outcomes.iter().filter(|o| o.is_sent()).count(),
            total = outcomes.len(),
            "Push batch finished"
        );
        Ok(outcomes)
    }
}
