// Service for suppressing repeated notification events.

use crate::core::NotificationEvent;
use moka::future::Cache;
use std::time::Duration;

/// Filters out events already seen within a time window. Event sources retry
/// on timeouts, so the same change can arrive more than once.
pub struct Deduplicator {
    cache: Cache<String, ()>,
}

impl Deduplicator {
    /// Creates a new `Deduplicator`.
    ///
    /// # Arguments
    /// * `ttl` - How long an event suppresses its repeats.
    /// * `max_capacity` - The maximum number of remembered events.
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_capacity)
            .build();
        Self { cache }
    }

    /// Returns `true` if an identical event was seen within the TTL.
    ///
    /// The first sighting is remembered atomically, so two concurrent
    /// deliveries of the same event yield exactly one `false`.
    pub async fn is_duplicate(&self, event: &NotificationEvent) -> bool {
        let key = generate_key(event);
        let entry = self.cache.entry(key).or_insert(()).await;

        metrics::gauge!("deduplication_cache_entries").set(self.cache.entry_count() as f64);

        !entry.is_fresh()
    }

    /// Drops the record of `event` so its next delivery is processed again.
    pub async fn forget(&self, event: &NotificationEvent) {
        self.cache.invalidate(&generate_key(event)).await;
    }
}

/// Digest of every field that makes two events distinct.
fn generate_key(event: &NotificationEvent) -> String {
    let data = format!(
        "{}::{}::{}::{:?}::{:?}::{:?}",
        event.trigger_type,
        event.location_key,
        event.substance_id.as_deref().unwrap_or_default(),
        event.old_status,
        event.new_status,
        event.current_value.map(f64::to_bits),
    );
    blake3::hash(data.as_bytes()).to_hex().to_string()
}
