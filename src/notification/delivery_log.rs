//! Best-effort audit trail of delivery attempts.
//!
//! Writes never fail the caller: a store error is logged and counted, then
//! dropped.

use crate::core::{Channel, Clock, DeliveryRecord, DeliveryStatus, DeliveryStore, SystemClock, TriggerType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// One attempt to deliver to one subscription over one channel.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt<'a> {
    pub subscription_id: &'a str,
    pub owner_id: &'a str,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub title: &'a str,
    pub body: &'a str,
    pub trigger_type: TriggerType,
    pub error: Option<&'a str>,
}

/// Records delivery attempts into a [`DeliveryStore`].
pub struct DeliveryLogger {
    store: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
}

impl DeliveryLogger {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Appends a record for `attempt`. Never returns an error.
    pub async fn record(&self, attempt: DeliveryAttempt<'_>) {
        let sent_at = self.clock.now();
        // The sequence keeps ids unique when the same pair is retried within
        // one clock tick.
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = format!(
            "{}_{}_{}_{}",
            attempt.subscription_id,
            attempt.channel,
            sent_at.timestamp_millis(),
            sequence
        );
        let record = DeliveryRecord {
            id,
            subscription_id: attempt.subscription_id.to_string(),
            owner_id: attempt.owner_id.to_string(),
            channel: attempt.channel,
            status: attempt.status,
            title: attempt.title.to_string(),
            body: attempt.body.to_string(),
            trigger_type: attempt.trigger_type,
            error: attempt.error.map(str::to_string),
            sent_at,
        };

        match self.store.append(&record).await {
            Ok(()) => debug!(record_id = %record.id, "Delivery recorded"),
            Err(e) => {
                metrics::counter!("delivery_log_failures_total").increment(1);
                error!(
                    subscription_id = %record.subscription_id,
                    channel = %record.channel,
                    error = %e,
                    "Failed to write delivery record"
                );
            }
        }
    }
}

/// Keeps records in memory. Used by tests and when no log file is configured.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDeliveryStore {
    records: Arc<Mutex<Vec<DeliveryRecord>>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeliveryRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn append(&self, record: &DeliveryRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Appends one JSON document per line to a file.
pub struct JsonLinesDeliveryStore {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesDeliveryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DeliveryStore for JsonLinesDeliveryStore {
    async fn append(&self, record: &DeliveryRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("Failed to open delivery log: {}", self.path.display()))?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&line).await?;
            file.flush().await?;
        }
        Ok(())
    }
}
