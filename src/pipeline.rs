//! Turns inbound data changes into dispatched notifications.
//!
//! `IngestEvent` → status evaluation against the current reference snapshot
//! → `NotificationEvent` → deduplication → subscriber lookup → dispatch.

use crate::core::{Measurement, NotificationEvent, SubscriberStore, TriggerType, ValidationError};
use crate::deduplication::Deduplicator;
use crate::notification::{DispatchReport, NotificationDispatcher};
use crate::reference::{ReferenceData, ReferenceStore};
use crate::status::assess;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// A measurement was created or updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementChange {
    /// Jurisdiction whose thresholds apply at the measurement's location.
    pub jurisdiction_code: String,
    pub current: Measurement,
    /// The value this measurement replaces, if any.
    #[serde(default)]
    pub previous_value: Option<f64>,
    /// Overrides the substance's display unit.
    #[serde(default)]
    pub unit: Option<String>,
}

/// What the event source reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestEvent {
    Measurement(MeasurementChange),
    DataAvailable { location_key: String },
}

impl IngestEvent {
    pub fn location_key(&self) -> &str {
        match self {
            IngestEvent::Measurement(change) => &change.current.location_key,
            IngestEvent::DataAvailable { location_key } => location_key,
        }
    }

    /// Checks the parts of the event that do not depend on reference data.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.location_key().trim().is_empty() {
            return Err(ValidationError::MissingLocation);
        }
        if let IngestEvent::Measurement(change) = self {
            if change.current.substance_id.trim().is_empty() {
                return Err(ValidationError::MissingField("substance_id"));
            }
            if change.jurisdiction_code.trim().is_empty() {
                return Err(ValidationError::MissingField("jurisdiction_code"));
            }
            for value in std::iter::once(change.current.value).chain(change.previous_value) {
                if !value.is_finite() {
                    return Err(ValidationError::NonFiniteValue(value));
                }
            }
        }
        Ok(())
    }

    /// Builds the notification event against one reference snapshot.
    ///
    /// A measurement whose status differs from the previous value's status
    /// becomes a `status_change`; anything else is a `data_update` carrying
    /// the current status.
    pub fn to_notification(&self, reference: &ReferenceData) -> Result<NotificationEvent, ValidationError> {
        self.validate()?;
        let event = match self {
            IngestEvent::DataAvailable { location_key } => {
                NotificationEvent::new(TriggerType::DataAvailable, location_key)
            }
            IngestEvent::Measurement(change) => {
                let measurement = &change.current;
                let substance = reference.substance(&measurement.substance_id);
                let current = assess(
                    reference,
                    &measurement.substance_id,
                    &change.jurisdiction_code,
                    measurement.value,
                );
                let previous = change.previous_value.map(|value| {
                    assess(reference, &measurement.substance_id, &change.jurisdiction_code, value).status
                });

                let trigger_type = match previous {
                    Some(previous) if previous != current.status => TriggerType::StatusChange,
                    _ => TriggerType::DataUpdate,
                };
                NotificationEvent {
                    trigger_type,
                    location_key: measurement.location_key.clone(),
                    substance_id: Some(measurement.substance_id.clone()),
                    substance_name: Some(
                        substance
                            .map(|s| s.display_name().to_string())
                            .unwrap_or_else(|| measurement.substance_id.clone()),
                    ),
                    old_status: previous,
                    new_status: Some(current.status),
                    current_value: Some(measurement.value),
                    unit: change.unit.clone().or_else(|| substance.and_then(|s| s.unit.clone())),
                }
            }
        };
        event.validate()?;
        Ok(event)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to load subscriptions for {location_key}")]
    Subscribers {
        location_key: String,
        #[source]
        source: anyhow::Error,
    },
}

pub struct AlertPipeline {
    reference: ReferenceStore,
    subscribers: Arc<dyn SubscriberStore>,
    dispatcher: Arc<NotificationDispatcher>,
    deduplicator: Option<Arc<Deduplicator>>,
}

impl AlertPipeline {
    pub fn new(
        reference: ReferenceStore,
        subscribers: Arc<dyn SubscriberStore>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            reference,
            subscribers,
            dispatcher,
            deduplicator: None,
        }
    }

    pub fn with_deduplicator(mut self, deduplicator: Arc<Deduplicator>) -> Self {
        self.deduplicator = Some(deduplicator);
        self
    }

    /// Processes one inbound event end to end.
    ///
    /// # Returns
    /// * `Ok(Some(report))` once the event has been dispatched
    /// * `Ok(None)` if the event repeated one seen within the dedup window
    #[instrument(skip_all, fields(location = %ingest.location_key()))]
    pub async fn process(&self, ingest: &IngestEvent) -> Result<Option<DispatchReport>, PipelineError> {
        metrics::counter!("events_received_total").increment(1);

        let snapshot = self.reference.snapshot();
        let event = ingest.to_notification(&snapshot).map_err(|e| {
            metrics::counter!("events_rejected_total").increment(1);
            warn!(error = %e, "Rejected inbound event");
            e
        })?;

        if let Some(deduplicator) = &self.deduplicator {
            if deduplicator.is_duplicate(&event).await {
                metrics::counter!("events_deduplicated_total").increment(1);
                debug!(trigger = %event.trigger_type, "Suppressed duplicate event");
                return Ok(None);
            }
        }

        let subscriptions = match self.subscribers.subscriptions_for(&event.location_key).await {
            Ok(subscriptions) => subscriptions,
            Err(source) => {
                // Nothing was delivered, so a retry must not be suppressed.
                if let Some(deduplicator) = &self.deduplicator {
                    deduplicator.forget(&event).await;
                }
                return Err(PipelineError::Subscribers {
                    location_key: event.location_key.clone(),
                    source,
                });
            }
        };

        let report = self.dispatcher.dispatch(&event, &subscriptions).await?;
        Ok(Some(report))
    }
}
