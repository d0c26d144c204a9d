//! Configuration management for SafeWatch
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer built-in defaults, a `safewatch.toml` file, environment
//! variables and command-line arguments.

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;
use crate::matching::UntouchedPreferencePolicy;

/// Configuration file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "safewatch.toml";

/// Default push endpoint of the Expo push service.
pub const EXPO_PUSH_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    pub performance: PerformanceConfig,
    pub reference: ReferenceConfig,
    pub subscribers: SubscribersConfig,
    pub notification: NotificationConfig,
    pub rate_limit: RateLimitConfig,
    pub deduplication: DeduplicationConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

/// Worker pool and queue sizing.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PerformanceConfig {
    /// Number of workers processing inbound events.
    pub worker_concurrency: usize,
    /// Capacity of the inbound event queue.
    pub queue_capacity: usize,
}

/// Where the regulatory reference data comes from.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ReferenceConfig {
    /// Path to the YAML reference document.
    pub data_path: Option<PathBuf>,
    /// Reload the document when it changes on disk.
    pub hot_reload: bool,
}

/// Where subscriptions and owner addresses come from.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SubscribersConfig {
    /// Path to the YAML subscriber directory.
    pub directory_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NotificationConfig {
    /// What subscribers who never customized their preferences receive.
    pub untouched_preferences: UntouchedPreferencePolicy,
    /// Upper bound for one channel call, in milliseconds.
    pub channel_timeout_ms: u64,
    /// Maximum concurrent delivery-log writes per dispatch.
    pub log_concurrency: usize,
    /// Append delivery records to this JSON-lines file. In memory if unset.
    pub delivery_log_path: Option<PathBuf>,
    pub email: Option<EmailConfig>,
    pub push: Option<PushConfig>,
}

/// How much sooner a single provider request gives up than its channel call.
const REQUEST_TIMEOUT_HEADROOM: Duration = Duration::from_millis(500);

impl NotificationConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    /// Timeout for one provider request.
    ///
    /// Shorter than the channel timeout, so a slow request fails on its own
    /// and requests that already finished keep their outcomes.
    pub fn request_timeout(&self) -> Duration {
        let channel = self.channel_timeout();
        channel.saturating_sub(REQUEST_TIMEOUT_HEADROOM).max(channel / 2)
    }
}

/// HTTP email relay settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmailConfig {
    pub endpoint: String,
    pub from_address: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Concurrent relay requests per batch.
    #[serde(default = "default_email_concurrency")]
    pub concurrency: usize,
}

fn default_email_concurrency() -> usize {
    16
}

/// Push service settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PushConfig {
    #[serde(default = "default_push_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Tokens per provider request, capped at 100.
    #[serde(default = "default_push_batch_size")]
    pub batch_size: usize,
    /// Provider requests in flight at once.
    #[serde(default = "default_push_concurrency")]
    pub concurrency: usize,
}

fn default_push_endpoint() -> String {
    EXPO_PUSH_ENDPOINT.to_string()
}

fn default_push_batch_size() -> usize {
    100
}

fn default_push_concurrency() -> usize {
    4
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: default_push_endpoint(),
            access_token: None,
            batch_size: default_push_batch_size(),
            concurrency: default_push_concurrency(),
        }
    }
}

/// Fixed-window rate limiting for sign-in requests.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub max_requests: u32,
    /// Upper bound on tracked identities. Identities evicted past this bound
    /// start a fresh window.
    pub max_identities: u64,
}

/// Configuration for event deduplication.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    /// The size of the deduplication cache.
    pub cache_size: u64,
    /// The time-to-live for cache entries in seconds.
    pub cache_ttl_seconds: u64,
}

/// The HTTP ingest surface.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_address: String,
}

/// The Prometheus `/metrics` endpoint.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: String,
}

impl Config {
    /// Loads the configuration by layering sources: defaults, file,
    /// environment, and CLI args.
    pub fn load(cli: &Cli) -> Result<Self> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let config = Self::figment(&path).merge(cli.clone()).extract::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from a file and the environment only.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config = Self::figment(path).extract::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            // Nested keys use a double underscore, e.g. SAFEWATCH_RATE_LIMIT__MAX_REQUESTS=5
            .merge(Env::prefixed("SAFEWATCH_").split("__"))
    }

    /// Rejects settings that would make the service unusable.
    pub fn validate(&self) -> Result<()> {
        if self.performance.worker_concurrency == 0 {
            bail!("performance.worker_concurrency must be at least 1");
        }
        if self.performance.queue_capacity == 0 {
            bail!("performance.queue_capacity must be at least 1");
        }
        if self.rate_limit.window_seconds == 0 {
            bail!("rate_limit.window_seconds must be at least 1");
        }
        if self.notification.channel_timeout_ms == 0 {
            bail!("notification.channel_timeout_ms must be at least 1");
        }
        if let Some(push) = &self.notification.push {
            if push.batch_size == 0 || push.batch_size > 100 {
                bail!("notification.push.batch_size must be between 1 and 100");
            }
        }
        Ok(())
    }
}

// Provide a default implementation for tests and easy setup.
impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            performance: PerformanceConfig {
                worker_concurrency: num_cpus::get(),
                queue_capacity: 10_000,
            },
            reference: ReferenceConfig {
                data_path: None,
                hot_reload: true,
            },
            subscribers: SubscribersConfig::default(),
            notification: NotificationConfig {
                untouched_preferences: UntouchedPreferencePolicy::DangerOnly,
                channel_timeout_ms: 10_000,
                log_concurrency: 100,
                delivery_log_path: None,
                email: None,
                push: None,
            },
            rate_limit: RateLimitConfig {
                window_seconds: 900,
                max_requests: 3,
                max_identities: 100_000,
            },
            deduplication: DeduplicationConfig {
                enabled: true,
                cache_size: 10_000,
                cache_ttl_seconds: 60,
            },
            api: ApiConfig {
                enabled: true,
                listen_address: "127.0.0.1:8080".to_string(),
            },
            metrics: MetricsConfig {
                enabled: false,
                listen_address: "127.0.0.1:9090".to_string(),
            },
        }
    }
}
