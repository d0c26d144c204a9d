//! Fakes for the collaborator traits, shared by unit and integration tests.

use crate::core::{
    Clock, DeliveryRecord, DeliveryStore, EmailMessage, EmailResolver, EmailSender, Preferences, PushMessage,
    PushSender, RecipientOutcome, SubscriberStore, Subscription,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Builds a subscription with predictable contact details:
/// `sub-3` is owned by `owner-3`, mails `owner-3@example.com` and has the
/// token `ExponentPushToken[sub-3]`.
pub fn subscription(id: &str, location_key: &str, preferences: Preferences) -> Subscription {
    let owner_id = id.replacen("sub", "owner", 1);
    Subscription {
        id: id.to_string(),
        email: Some(format!("{}@example.com", owner_id)),
        owner_id,
        location_key: location_key.to_string(),
        preferences,
        watch_list: BTreeSet::new(),
        push_token: Some(format!("ExponentPushToken[{}]", id)),
    }
}

/// Email sender that records every batch and fails chosen addresses.
#[derive(Default)]
pub struct FakeEmailSender {
    failing: HashSet<String>,
    batch_error: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<String>>>,
    messages: Mutex<Vec<EmailMessage>>,
}

impl FakeEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports a failure for `address` only.
    pub fn failing_for(mut self, address: &str) -> Self {
        self.failing.insert(address.to_string());
        self
    }

    /// Fails the whole batch with `error`.
    pub fn with_batch_error(mut self, error: &str) -> Self {
        self.batch_error = Some(error.to_string());
        self
    }

    /// Sleeps before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<EmailMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for FakeEmailSender {
    fn name(&self) -> &str {
        "fake_email"
    }

    async fn send(&self, message: &EmailMessage, addresses: &[String]) -> Result<Vec<RecipientOutcome>> {
        self.calls.lock().unwrap().push(addresses.to_vec());
        self.messages.lock().unwrap().push(message.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.batch_error {
            return Err(anyhow!(error.clone()));
        }
        Ok(addresses
            .iter()
            .map(|address| {
                if self.failing.contains(address) {
                    RecipientOutcome::failed(address.as_str(), "mailbox unavailable")
                } else {
                    RecipientOutcome::sent(address.as_str())
                }
            })
            .collect())
    }
}

/// Push sender that records every batch and rejects chosen tokens as
/// unregistered.
#[derive(Default)]
pub struct FakePushSender {
    unregistered: HashSet<String>,
    calls: Mutex<Vec<Vec<String>>>,
    messages: Mutex<Vec<PushMessage>>,
}

impl FakePushSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unregistered(mut self, token: &str) -> Self {
        self.unregistered.insert(token.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<PushMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushSender for FakePushSender {
    fn name(&self) -> &str {
        "fake_push"
    }

    async fn send(&self, message: &PushMessage, tokens: &[String]) -> Result<Vec<RecipientOutcome>> {
        self.calls.lock().unwrap().push(tokens.to_vec());
        self.messages.lock().unwrap().push(message.clone());
        Ok(tokens
            .iter()
            .map(|token| {
                if self.unregistered.contains(token) {
                    RecipientOutcome::unregistered(token.as_str(), "DeviceNotRegistered")
                } else {
                    RecipientOutcome::sent(token.as_str())
                }
            })
            .collect())
    }
}

/// Resolver backed by a fixed owner → address map.
#[derive(Default)]
pub struct FakeEmailResolver {
    addresses: HashMap<String, String>,
    failing: HashSet<String>,
}

impl FakeEmailResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, owner_id: &str, address: &str) -> Self {
        self.addresses.insert(owner_id.to_string(), address.to_string());
        self
    }

    pub fn failing_for(mut self, owner_id: &str) -> Self {
        self.failing.insert(owner_id.to_string());
        self
    }
}

#[async_trait]
impl EmailResolver for FakeEmailResolver {
    async fn resolve(&self, owner_id: &str) -> Result<Option<String>> {
        if self.failing.contains(owner_id) {
            return Err(anyhow!("identity service unavailable"));
        }
        Ok(self.addresses.get(owner_id).cloned())
    }
}

/// A delivery store whose writes always fail.
pub struct FailingDeliveryStore;

#[async_trait]
impl DeliveryStore for FailingDeliveryStore {
    async fn append(&self, _record: &DeliveryRecord) -> Result<()> {
        Err(anyhow!("delivery store is read-only"))
    }
}

/// A subscriber store whose lookups always fail.
pub struct FailingSubscriberStore;

#[async_trait]
impl SubscriberStore for FailingSubscriberStore {
    async fn subscriptions_for(&self, _location_key: &str) -> Result<Vec<Subscription>> {
        Err(anyhow!("subscriber index unavailable"))
    }
}

/// A subscriber store that fails its first `failures` lookups.
pub struct FlakySubscriberStore {
    failures_left: Mutex<usize>,
    subscriptions: Vec<Subscription>,
}

impl FlakySubscriberStore {
    pub fn new(failures: usize, subscriptions: Vec<Subscription>) -> Self {
        Self {
            failures_left: Mutex::new(failures),
            subscriptions,
        }
    }
}

#[async_trait]
impl SubscriberStore for FlakySubscriberStore {
    async fn subscriptions_for(&self, location_key: &str) -> Result<Vec<Subscription>> {
        {
            let mut failures_left = self.failures_left.lock().unwrap();
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(anyhow!("subscriber index unavailable"));
            }
        }
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.location_key == location_key)
            .cloned()
            .collect())
    }
}
