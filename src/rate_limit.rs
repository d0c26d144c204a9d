//! Identity-keyed, fixed-window request limiting.
//!
//! Used ahead of any flow that issues a time-boxed secret, such as a sign-in
//! link. Callers either `check` before the gated action and `record` after it
//! ran, or use `try_acquire` to do both in one atomic store update.

use crate::config::RateLimitConfig;
use crate::core::{Clock, SystemClock};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Counter state for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

impl RateLimitState {
    pub fn reset_at(&self, window: ChronoDuration) -> DateTime<Utc> {
        self.window_start + window
    }

    fn is_expired(&self, now: DateTime<Utc>, window: ChronoDuration) -> bool {
        now >= self.reset_at(window)
    }
}

/// A closure applied to an identity's state inside the store's atomic section.
pub type StateUpdate = Box<dyn FnOnce(Option<RateLimitState>) -> RateLimitState + Send>;

/// Durable counter storage with per-identity atomic updates.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn load(&self, identity: &str) -> Result<Option<RateLimitState>>;

    /// Applies `update` to the identity's state as a single read-modify-write.
    /// Concurrent updates for the same identity must be serialized.
    async fn update(&self, identity: &str, update: StateUpdate) -> Result<RateLimitState>;
}

/// In-process store backed by a concurrent cache. Entries expire once their
/// window can no longer matter.
///
/// At most `max_identities` identities are tracked. Past that the cache
/// evicts entries, and an evicted identity starts a fresh window on its next
/// request, so a flood of distinct identities can reopen a limited one. Size
/// `max_identities` above the number of identities expected in one window.
pub struct MokaRateLimitStore {
    cache: Cache<String, RateLimitState>,
}

impl MokaRateLimitStore {
    pub fn new(window: Duration, max_identities: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(window)
            .max_capacity(max_identities)
            .build();
        Self { cache }
    }
}

#[async_trait]
impl RateLimitStore for MokaRateLimitStore {
    async fn load(&self, identity: &str) -> Result<Option<RateLimitState>> {
        Ok(self.cache.get(identity).await)
    }

    async fn update(&self, identity: &str, update: StateUpdate) -> Result<RateLimitState> {
        let entry = self
            .cache
            .entry(identity.to_string())
            .and_upsert_with(|existing| {
                let next = update(existing.map(|e| e.into_value()));
                std::future::ready(next)
            })
            .await;
        Ok(entry.into_value())
    }
}

/// The limiter's answer for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Set when denied: the moment the current window ends.
    pub reset_at: Option<DateTime<Utc>>,
    /// Requests left in the current window after this decision.
    pub remaining: u32,
}

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry after {reset_at}")]
    Exceeded { reset_at: DateTime<Utc> },

    #[error("rate limit store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// Fixed-window limiter: at most `max_requests` per identity per `window`.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    window: ChronoDuration,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, window: Duration, max_requests: u32) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            window: ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX),
            max_requests,
        }
    }

    /// Builds a limiter with an in-process store from configuration.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let window = Duration::from_secs(config.window_seconds);
        let store = Arc::new(MokaRateLimitStore::new(window, config.max_identities));
        Self::new(store, window, config.max_requests)
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Time left until `reset_at`, at least one second.
    pub fn retry_after(&self, reset_at: DateTime<Utc>) -> Duration {
        let seconds = (reset_at - self.clock.now()).num_seconds().max(1);
        Duration::from_secs(seconds as u64)
    }

    /// Identities are compared case-insensitively and without surrounding
    /// whitespace, so `A@x.com ` and `a@x.com` share a window.
    fn normalize(identity: &str) -> String {
        identity.trim().to_lowercase()
    }

    /// Reports whether one more request for `identity` would be allowed,
    /// without counting it.
    #[instrument(skip(self))]
    pub async fn check(&self, identity: &str) -> Result<RateLimitDecision> {
        let key = Self::normalize(identity);
        let now = self.clock.now();
        let decision = match self.store.load(&key).await? {
            Some(state) if !state.is_expired(now, self.window) => {
                if state.count < self.max_requests {
                    RateLimitDecision {
                        allowed: true,
                        reset_at: None,
                        remaining: self.max_requests - state.count,
                    }
                } else {
                    RateLimitDecision {
                        allowed: false,
                        reset_at: Some(state.reset_at(self.window)),
                        remaining: 0,
                    }
                }
            }
            _ => RateLimitDecision {
                allowed: self.max_requests > 0,
                reset_at: None,
                remaining: self.max_requests,
            },
        };
        if !decision.allowed {
            metrics::counter!("rate_limit_denied_total").increment(1);
            debug!(identity = %key, reset_at = ?decision.reset_at, "Rate limit reached");
        }
        Ok(decision)
    }

    /// Counts one executed request for `identity`, opening a new window if
    /// the previous one has ended.
    #[instrument(skip(self))]
    pub async fn record(&self, identity: &str) -> Result<()> {
        let key = Self::normalize(identity);
        let now = self.clock.now();
        let window = self.window;
        self.store
            .update(
                &key,
                Box::new(move |state| match state {
                    Some(state) if !state.is_expired(now, window) => RateLimitState {
                        count: state.count.saturating_add(1),
                        ..state
                    },
                    _ => RateLimitState {
                        window_start: now,
                        count: 1,
                    },
                }),
            )
            .await?;
        Ok(())
    }

    /// Checks and records in one atomic update. A denied request leaves the
    /// stored state untouched.
    #[instrument(skip(self))]
    pub async fn try_acquire(&self, identity: &str) -> Result<RateLimitDecision, RateLimitError> {
        let key = Self::normalize(identity);
        let now = self.clock.now();
        let window = self.window;
        let max_requests = self.max_requests;
        let admitted = Arc::new(AtomicBool::new(false));
        let admitted_in_update = admitted.clone();

        let state = self
            .store
            .update(
                &key,
                Box::new(move |state| {
                    let current = match state {
                        Some(state) if !state.is_expired(now, window) => state,
                        _ => RateLimitState {
                            window_start: now,
                            count: 0,
                        },
                    };
                    if current.count < max_requests {
                        admitted_in_update.store(true, Ordering::SeqCst);
                        RateLimitState {
                            count: current.count + 1,
                            ..current
                        }
                    } else {
                        current
                    }
                }),
            )
            .await?;

        if admitted.load(Ordering::SeqCst) {
            Ok(RateLimitDecision {
                allowed: true,
                reset_at: None,
                remaining: max_requests.saturating_sub(state.count),
            })
        } else {
            metrics::counter!("rate_limit_denied_total").increment(1);
            let reset_at = state.reset_at(window);
            debug!(identity = %key, %reset_at, "Rate limit reached");
            Err(RateLimitError::Exceeded { reset_at })
        }
    }
}
