//! File-backed subscriber data: subscriptions indexed by location and an
//! owner → email directory.

use crate::core::{EmailResolver, SubscriberStore, Subscription};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

/// On-disk layout of the subscriber directory.
#[derive(Debug, Default, Deserialize)]
pub struct SubscriberDirectory {
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    /// Owner id → email address.
    #[serde(default)]
    pub owners: HashMap<String, String>,
}

impl SubscriberDirectory {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yml::from_str(content).context("Failed to parse subscriber directory")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read subscriber directory: {}", path.display()))?;
        let directory = Self::from_yaml_str(&content)?;
        info!(
            path = %path.display(),
            subscriptions = directory.subscriptions.len(),
            owners = directory.owners.len(),
            "Loaded subscriber directory"
        );
        Ok(directory)
    }

    pub fn into_parts(self) -> (InMemorySubscriberStore, DirectoryEmailResolver) {
        (
            InMemorySubscriberStore::from_subscriptions(self.subscriptions),
            DirectoryEmailResolver::new(self.owners),
        )
    }
}

/// Subscriptions indexed by location key.
#[derive(Debug, Default)]
pub struct InMemorySubscriberStore {
    by_location: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl InMemorySubscriberStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_subscriptions(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let mut by_location: HashMap<String, Vec<Subscription>> = HashMap::new();
        for sub in subscriptions {
            by_location.entry(sub.location_key.clone()).or_default().push(sub);
        }
        Self {
            by_location: RwLock::new(by_location),
        }
    }

    /// Clears the push token of every subscription using `token`.
    ///
    /// Returns the number of subscriptions changed.
    pub async fn clear_push_token(&self, token: &str) -> usize {
        let mut index = self.by_location.write().await;
        let mut cleared = 0;
        for sub in index.values_mut().flatten() {
            if sub.push_token.as_deref() == Some(token) {
                sub.push_token = None;
                cleared += 1;
            }
        }
        cleared
    }
}

#[async_trait]
impl SubscriberStore for InMemorySubscriberStore {
    async fn subscriptions_for(&self, location_key: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .by_location
            .read()
            .await
            .get(location_key)
            .cloned()
            .unwrap_or_default())
    }
}

/// Resolves owners against a static directory.
#[derive(Debug, Default, Clone)]
pub struct DirectoryEmailResolver {
    owners: HashMap<String, String>,
}

impl DirectoryEmailResolver {
    pub fn new(owners: HashMap<String, String>) -> Self {
        Self { owners }
    }
}

#[async_trait]
impl EmailResolver for DirectoryEmailResolver {
    async fn resolve(&self, owner_id: &str) -> Result<Option<String>> {
        Ok(self.owners.get(owner_id).cloned())
    }
}
