//! Core domain types and service traits for SafeWatch
//!
//! This module defines the reference data, subscriber and event structures,
//! along with the trait contracts for every external collaborator the
//! notification core talks to (channel senders, stores, resolvers).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Code of the global default jurisdiction every fallback chain ends at.
pub const GLOBAL_JURISDICTION: &str = "WHO";

/// Fraction of the limit at which a warning begins when a threshold does not
/// carry its own ratio.
pub const DEFAULT_WARNING_RATIO: f64 = 0.8;

// =============================================================================
// Reference Data
// =============================================================================

/// A measurable substance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Substance {
    pub id: String,
    /// Human readable name used in notification copy.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether a larger value means worse safety.
    #[serde(default = "default_higher_is_bad")]
    pub higher_is_bad: bool,
    /// Display unit for values of this substance (e.g. "ppb").
    #[serde(default)]
    pub unit: Option<String>,
}

impl Substance {
    /// Returns the display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn default_higher_is_bad() -> bool {
    true
}

/// A regulatory scope. Jurisdictions form a shallow tree rooted at
/// [`GLOBAL_JURISDICTION`]; the parent is kept as a plain code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jurisdiction {
    pub code: String,
    #[serde(default)]
    pub parent_code: Option<String>,
}

/// Regulatory status of a substance within a jurisdiction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegulatoryStatus {
    #[default]
    Regulated,
    NotControlled,
    Banned,
}

/// The regulatory limit for one substance in one jurisdiction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Threshold {
    pub substance_id: String,
    pub jurisdiction_code: String,
    #[serde(default)]
    pub limit_value: Option<f64>,
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
    #[serde(default)]
    pub status: RegulatoryStatus,
}

fn default_warning_ratio() -> f64 {
    DEFAULT_WARNING_RATIO
}

impl Threshold {
    /// Builds a regulated threshold with the default warning ratio.
    pub fn regulated(substance_id: &str, jurisdiction_code: &str, limit_value: f64) -> Self {
        Self {
            substance_id: substance_id.to_string(),
            jurisdiction_code: jurisdiction_code.to_string(),
            limit_value: Some(limit_value),
            warning_ratio: DEFAULT_WARNING_RATIO,
            status: RegulatoryStatus::Regulated,
        }
    }
}

// =============================================================================
// Measurements and Status
// =============================================================================

/// Three-level safety status. Ordered by severity: `Safe < Warning < Danger`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SafetyStatus {
    Safe,
    Warning,
    Danger,
}

impl fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyStatus::Safe => "safe",
            SafetyStatus::Warning => "warning",
            SafetyStatus::Danger => "danger",
        };
        write!(f, "{}", s)
    }
}

/// A single recorded value of a substance at a location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    pub substance_id: String,
    pub location_key: String,
    pub value: f64,
    pub measured_at: DateTime<Utc>,
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Notification preferences of a subscription.
///
/// Every flag is a concrete boolean; missing keys take their default once at
/// deserialization time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Preferences {
    pub enable_push: bool,
    pub enable_email: bool,
    pub alert_on_danger: bool,
    pub alert_on_warning: bool,
    pub alert_on_any_change: bool,
    pub notify_when_data_available: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            enable_push: true,
            enable_email: false,
            alert_on_danger: false,
            alert_on_warning: false,
            alert_on_any_change: false,
            notify_when_data_available: false,
        }
    }
}

impl Preferences {
    /// `true` when none of the alert-class flags has been turned on.
    pub fn is_untouched(&self) -> bool {
        !self.alert_on_danger && !self.alert_on_warning && !self.alert_on_any_change
    }
}

/// A subscriber's interest in one location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub owner_id: String,
    pub location_key: String,
    #[serde(default)]
    pub preferences: Preferences,
    /// Substances allowed to trigger alerts. Empty means all substances.
    #[serde(default)]
    pub watch_list: BTreeSet<String>,
    #[serde(default)]
    pub push_token: Option<String>,
    /// Pre-resolved delivery address, if known.
    #[serde(default)]
    pub email: Option<String>,
}

// =============================================================================
// Notification Events
// =============================================================================

/// Why a notification event was generated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    DataUpdate,
    DataAvailable,
    StatusChange,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerType::DataUpdate => "data_update",
            TriggerType::DataAvailable => "data_available",
            TriggerType::StatusChange => "status_change",
        };
        write!(f, "{}", s)
    }
}

/// A change at a location that may need to reach subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    pub trigger_type: TriggerType,
    pub location_key: String,
    #[serde(default)]
    pub substance_id: Option<String>,
    /// Display name of the substance for notification copy.
    #[serde(default)]
    pub substance_name: Option<String>,
    #[serde(default)]
    pub old_status: Option<SafetyStatus>,
    #[serde(default)]
    pub new_status: Option<SafetyStatus>,
    #[serde(default)]
    pub current_value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl NotificationEvent {
    /// Creates a bare event for a location.
    pub fn new(trigger_type: TriggerType, location_key: &str) -> Self {
        Self {
            trigger_type,
            location_key: location_key.to_string(),
            substance_id: None,
            substance_name: None,
            old_status: None,
            new_status: None,
            current_value: None,
            unit: None,
        }
    }

    /// Creates a `status_change` event for a substance.
    pub fn status_change(
        location_key: &str,
        substance_id: &str,
        old_status: SafetyStatus,
        new_status: SafetyStatus,
    ) -> Self {
        Self {
            substance_id: Some(substance_id.to_string()),
            old_status: Some(old_status),
            new_status: Some(new_status),
            ..Self::new(TriggerType::StatusChange, location_key)
        }
    }

    /// Rejects events that cannot be dispatched.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.location_key.trim().is_empty() {
            return Err(ValidationError::MissingLocation);
        }
        if self.trigger_type == TriggerType::StatusChange {
            if self.substance_id.as_deref().map_or(true, |s| s.trim().is_empty()) {
                return Err(ValidationError::MissingField("substance_id"));
            }
            if self.old_status.is_none() {
                return Err(ValidationError::MissingField("old_status"));
            }
            if self.new_status.is_none() {
                return Err(ValidationError::MissingField("new_status"));
            }
        }
        if let Some(value) = self.current_value {
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteValue(value));
            }
        }
        Ok(())
    }
}

/// A malformed inbound event. Raised before any side effect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("event has an empty location key")]
    MissingLocation,

    #[error("status_change event is missing `{0}`")]
    MissingField(&'static str),

    #[error("measured value must be finite, got {0}")]
    NonFiniteValue(f64),
}

// =============================================================================
// Delivery
// =============================================================================

/// A delivery mechanism.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Push => write!(f, "push"),
            Channel::Email => write!(f, "email"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// One entry of the append-only delivery audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    pub id: String,
    pub subscription_id: String,
    pub owner_id: String,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub title: String,
    pub body: String,
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Content handed to the email channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmailMessage {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Content handed to the push channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// The result a channel reports for a single recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientOutcome {
    /// The address or device token this outcome is for.
    pub recipient: String,
    /// `None` when the message was accepted.
    pub error: Option<String>,
    /// Set when the channel reports the device token as permanently invalid.
    pub unregistered: bool,
}

impl RecipientOutcome {
    pub fn sent(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            error: None,
            unregistered: false,
        }
    }

    pub fn failed(recipient: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            error: Some(error.into()),
            unregistered: false,
        }
    }

    pub fn unregistered(recipient: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            unregistered: true,
            ..Self::failed(recipient, error)
        }
    }

    pub fn is_sent(&self) -> bool {
        self.error.is_none()
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Sends one email to a batch of addresses.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// A short name used for logging and metrics.
    fn name(&self) -> &str;

    /// Sends `message` to every address.
    ///
    /// # Returns
    /// * `Ok(outcomes)` with one outcome per address, in input order
    /// * `Err` if the whole batch could not be attempted
    async fn send(&self, message: &EmailMessage, addresses: &[String]) -> Result<Vec<RecipientOutcome>>;
}

/// Sends one push notification to a batch of device tokens.
#[async_trait]
pub trait PushSender: Send + Sync {
    /// A short name used for logging and metrics.
    fn name(&self) -> &str;

    /// Sends `message` to every token. Implementations split the tokens into
    /// provider-sized chunks themselves.
    ///
    /// # Returns
    /// * `Ok(outcomes)` with one outcome per token, in input order
    /// * `Err` if the whole batch could not be attempted
    async fn send(&self, message: &PushMessage, tokens: &[String]) -> Result<Vec<RecipientOutcome>>;
}

/// Resolves a subscription owner to a deliverable email address.
#[async_trait]
pub trait EmailResolver: Send + Sync {
    /// Returns `Ok(None)` when the owner has no address on file.
    async fn resolve(&self, owner_id: &str) -> Result<Option<String>>;
}

/// Supplies the subscriptions registered for a location.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn subscriptions_for(&self, location_key: &str) -> Result<Vec<Subscription>>;
}

/// Append-only sink for delivery records.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn append(&self, record: &DeliveryRecord) -> Result<()>;
}
