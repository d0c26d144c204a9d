//! Fans one notification event out to the email and push channels.
//!
//! A dispatch filters the candidate subscriptions, splits the survivors into
//! an email group and a push group, sends one batch per channel concurrently
//! and folds the per-recipient outcomes into a [`DispatchReport`]. Failures
//! local to a recipient or a channel never fail the dispatch itself; only an
//! invalid event does.

use crate::core::{
    Channel, DeliveryStatus, EmailResolver, EmailSender, NotificationEvent, PushSender, RecipientOutcome,
    SafetyStatus, Subscription, TriggerType, ValidationError,
};
use crate::matching::SubscriberMatcher;
use crate::notification::delivery_log::{DeliveryAttempt, DeliveryLogger};
use crate::notification::templates::{self, NotificationContent};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use regex::Regex;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// A delivery failure on one channel. Collected, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelSendError {
    #[error("{channel} delivery for subscription {subscription_id} failed: {reason}")]
    Recipient {
        channel: Channel,
        subscription_id: String,
        reason: String,
    },

    #[error("{channel} channel failed for a batch of {recipients}: {reason}")]
    Batch {
        channel: Channel,
        recipients: usize,
        reason: String,
    },
}

/// Per-channel tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounts {
    pub email: usize,
    pub push: usize,
}

impl ChannelCounts {
    fn bump(&mut self, channel: Channel) {
        match channel {
            Channel::Email => self.email += 1,
            Channel::Push => self.push += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.email + self.push
    }
}

/// Aggregate result of one dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Distinct subscriptions that got at least one delivery attempt.
    pub notified_count: usize,
    pub sent: ChannelCounts,
    pub failed: ChannelCounts,
    pub errors: Vec<ChannelSendError>,
    /// Device tokens the push provider reported as no longer registered.
    pub invalid_tokens: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Upper bound for one channel call.
    pub channel_timeout: Duration,
    /// Upper bound on concurrent delivery-log writes.
    pub log_concurrency: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            channel_timeout: Duration::from_secs(10),
            log_concurrency: 100,
        }
    }
}

/// One recipient of one channel, tied back to its subscription.
struct Recipient<'a> {
    subscription: &'a Subscription,
    address: String,
}

/// The outcome of one (subscription, channel) attempt.
struct Attempt<'a> {
    subscription: &'a Subscription,
    channel: Channel,
    error: Option<String>,
}

pub struct NotificationDispatcher {
    matcher: SubscriberMatcher,
    email: Option<Arc<dyn EmailSender>>,
    push: Option<Arc<dyn PushSender>>,
    resolver: Option<Arc<dyn EmailResolver>>,
    logger: Arc<DeliveryLogger>,
    settings: DispatchSettings,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl NotificationDispatcher {
    pub fn new(matcher: SubscriberMatcher, logger: Arc<DeliveryLogger>) -> Self {
        Self {
            matcher,
            email: None,
            push: None,
            resolver: None,
            logger,
            settings: DispatchSettings::default(),
            shutdown_rx: None,
        }
    }

    pub fn with_email(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email = Some(sender);
        self
    }

    pub fn with_push(mut self, sender: Arc<dyn PushSender>) -> Self {
        self.push = Some(sender);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn EmailResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Stops delivery-log writes once `true` is observed on `shutdown_rx`.
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    /// Delivers `event` to every matching subscription.
    ///
    /// # Errors
    /// Returns a [`ValidationError`] if the event is malformed. Nothing is
    /// sent or logged in that case.
    #[instrument(skip_all, fields(location = %event.location_key, trigger = %event.trigger_type))]
    pub async fn dispatch(
        &self,
        event: &NotificationEvent,
        subscriptions: &[Subscription],
    ) -> Result<DispatchReport, ValidationError> {
        event.validate()?;
        let started = Instant::now();

        let matched: Vec<&Subscription> = subscriptions
            .iter()
            .filter(|sub| self.matcher.should_notify(sub, event))
            .collect();
        metrics::counter!("subscribers_matched_total").increment(matched.len() as u64);
        if matched.is_empty() {
            debug!(candidates = subscriptions.len(), "No subscription matched the event");
            return Ok(DispatchReport::default());
        }

        let email_group = self.email_group(event, &matched).await;
        let push_group = self.push_group(&matched);

        let content = templates::render(event);
        let (email_attempts, push_attempts) =
            tokio::join!(self.send_email(&content, event, &email_group), self.send_push(&content, event, &push_group));

        let mut report = DispatchReport::default();
        let mut attempts = Vec::with_capacity(email_group.len() + push_group.len());
        for channel_result in [email_attempts, push_attempts] {
            let ChannelResult {
                attempts: channel_attempts,
                batch_error,
                invalid_tokens,
            } = channel_result;
            // A batch error already covers every recipient of its channel.
            let batch_failed = batch_error.is_some();
            report.errors.extend(batch_error);
            report.invalid_tokens.extend(invalid_tokens);
            for attempt in channel_attempts {
                match &attempt.error {
                    None => report.sent.bump(attempt.channel),
                    Some(reason) => {
                        report.failed.bump(attempt.channel);
                        if !batch_failed {
                            report.errors.push(ChannelSendError::Recipient {
                                channel: attempt.channel,
                                subscription_id: attempt.subscription.id.clone(),
                                reason: reason.clone(),
                            });
                        }
                    }
                }
                attempts.push(attempt);
            }
        }
        report.notified_count = attempts.iter().map(|a| a.subscription.id.as_str()).unique().count();

        self.record_attempts(&attempts, &content, event.trigger_type).await;

        record_metrics(&report);
        metrics::histogram!("dispatch_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(
            matched = matched.len(),
            notified = report.notified_count,
            sent = report.sent.total(),
            failed = report.failed.total(),
            invalid_tokens = report.invalid_tokens.len(),
            "Dispatch finished"
        );
        Ok(report)
    }

    /// Subscriptions reachable by email, with their resolved addresses.
    async fn email_group<'a>(&self, event: &NotificationEvent, matched: &[&'a Subscription]) -> Vec<Recipient<'a>> {
        if self.email.is_none() {
            return Vec::new();
        }
        // A transition back to safe is not alert-worthy for email.
        if event.trigger_type == TriggerType::StatusChange && event.new_status == Some(SafetyStatus::Safe) {
            debug!("Skipping email channel for a transition to safe");
            return Vec::new();
        }

        let candidates = matched.iter().filter(|sub| sub.preferences.enable_email);
        let resolved = join_all(candidates.map(|sub| async move {
            let address = self.resolve_address(sub).await?;
            Some(Recipient {
                subscription: *sub,
                address,
            })
        }))
        .await;
        resolved.into_iter().flatten().collect()
    }

    async fn resolve_address(&self, subscription: &Subscription) -> Option<String> {
        let address = match &subscription.email {
            Some(address) => Some(address.trim().to_string()),
            None => match &self.resolver {
                Some(resolver) => match resolver.resolve(&subscription.owner_id).await {
                    Ok(address) => address,
                    Err(e) => {
                        warn!(
                            subscription_id = %subscription.id,
                            owner_id = %subscription.owner_id,
                            error = %e,
                            "Email resolution failed, excluding subscription from email"
                        );
                        None
                    }
                },
                None => None,
            },
        };
        match address {
            Some(address) if is_deliverable_address(&address) => Some(address),
            Some(address) => {
                warn!(subscription_id = %subscription.id, address = %address, "Ignoring malformed email address");
                None
            }
            None => {
                debug!(subscription_id = %subscription.id, "No email address on file");
                None
            }
        }
    }

    fn push_group<'a>(&self, matched: &[&'a Subscription]) -> Vec<Recipient<'a>> {
        if self.push.is_none() {
            return Vec::new();
        }
        matched
            .iter()
            .filter(|sub| sub.preferences.enable_push)
            .filter_map(|sub| {
                let token = sub.push_token.as_deref()?.trim();
                (!token.is_empty()).then(|| Recipient {
                    subscription: *sub,
                    address: token.to_string(),
                })
            })
            .collect()
    }

    async fn send_email<'a>(
        &self,
        content: &NotificationContent,
        event: &NotificationEvent,
        group: &[Recipient<'a>],
    ) -> ChannelResult<'a> {
        let Some(sender) = self.email.as_ref().filter(|_| !group.is_empty()) else {
            return ChannelResult::default();
        };
        let message = templates::email_message(content, event);
        let addresses: Vec<String> = group.iter().map(|r| r.address.clone()).collect();
        debug!(sender = sender.name(), count = addresses.len(), "Sending email batch");
        let outcome = self.bounded(sender.send(&message, &addresses)).await;
        ChannelResult::collect(Channel::Email, group, outcome)
    }

    async fn send_push<'a>(
        &self,
        content: &NotificationContent,
        event: &NotificationEvent,
        group: &[Recipient<'a>],
    ) -> ChannelResult<'a> {
        let Some(sender) = self.push.as_ref().filter(|_| !group.is_empty()) else {
            return ChannelResult::default();
        };
        let message = templates::push_message(content, event);
        let tokens: Vec<String> = group.iter().map(|r| r.address.clone()).collect();
        debug!(sender = sender.name(), count = tokens.len(), "Sending push batch");
        let outcome = self.bounded(sender.send(&message, &tokens)).await;
        ChannelResult::collect(Channel::Push, group, outcome)
    }

    /// Applies the channel timeout and flattens the error to a reason string.
    async fn bounded<F>(&self, call: F) -> Result<Vec<RecipientOutcome>, String>
    where
        F: Future<Output = anyhow::Result<Vec<RecipientOutcome>>>,
    {
        match tokio::time::timeout(self.settings.channel_timeout, call).await {
            Ok(Ok(outcomes)) => Ok(outcomes),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("timed out after {:?}", self.settings.channel_timeout)),
        }
    }

    async fn record_attempts(&self, attempts: &[Attempt<'_>], content: &NotificationContent, trigger_type: TriggerType) {
        let logger = &self.logger;
        stream::iter(attempts)
            .for_each_concurrent(self.settings.log_concurrency.max(1), |attempt| async move {
                if self.is_cancelled() {
                    debug!(subscription_id = %attempt.subscription.id, "Dispatch cancelled, skipping delivery record");
                    return;
                }
                let status = if attempt.error.is_none() {
                    DeliveryStatus::Sent
                } else {
                    DeliveryStatus::Failed
                };
                logger
                    .record(DeliveryAttempt {
                        subscription_id: &attempt.subscription.id,
                        owner_id: &attempt.subscription.owner_id,
                        channel: attempt.channel,
                        status,
                        title: &content.title,
                        body: &content.body,
                        trigger_type,
                        error: attempt.error.as_deref(),
                    })
                    .await;
            })
            .await;
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// What one channel call produced.
#[derive(Default)]
struct ChannelResult<'a> {
    attempts: Vec<Attempt<'a>>,
    batch_error: Option<ChannelSendError>,
    invalid_tokens: Vec<String>,
}

impl<'a> ChannelResult<'a> {
    /// Pairs outcomes with recipients by position. A recipient without an
    /// outcome counts as failed.
    fn collect(
        channel: Channel,
        group: &[Recipient<'a>],
        outcome: Result<Vec<RecipientOutcome>, String>,
    ) -> Self {
        match outcome {
            Ok(outcomes) => {
                let mut result = ChannelResult::default();
                for (i, recipient) in group.iter().enumerate() {
                    let error = match outcomes.get(i) {
                        Some(outcome) => {
                            if outcome.unregistered && channel == Channel::Push {
                                result.invalid_tokens.push(recipient.address.clone());
                            }
                            outcome.error.clone()
                        }
                        None => Some("channel reported no outcome for recipient".to_string()),
                    };
                    result.attempts.push(Attempt {
                        subscription: recipient.subscription,
                        channel,
                        error,
                    });
                }
                result
            }
            Err(reason) => {
                warn!(channel = %channel, recipients = group.len(), reason = %reason, "Channel call failed");
                ChannelResult {
                    attempts: group
                        .iter()
                        .map(|r| Attempt {
                            subscription: r.subscription,
                            channel,
                            error: Some(reason.clone()),
                        })
                        .collect(),
                    batch_error: Some(ChannelSendError::Batch {
                        channel,
                        recipients: group.len(),
                        reason,
                    }),
                    invalid_tokens: Vec::new(),
                }
            }
        }
    }
}

fn record_metrics(report: &DispatchReport) {
    for (channel, sent, failed) in [
        ("email", report.sent.email, report.failed.email),
        ("push", report.sent.push, report.failed.push),
    ] {
        metrics::counter!("notifications_sent_total", "channel" => channel).increment(sent as u64);
        metrics::counter!("notifications_failed_total", "channel" => channel).increment(failed as u64);
    }
    metrics::counter!("invalid_push_tokens_total").increment(report.invalid_tokens.len() as u64);
}

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s.]+$").expect("static email pattern is valid"))
}

/// Loose `local@domain.tld` shape check.
pub fn is_deliverable_address(address: &str) -> bool {
    address_pattern().is_match(address)
}
