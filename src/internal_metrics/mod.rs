//! # Internal Metrics Module
//!
//! This module provides the infrastructure for collecting and exposing
//! application metrics.
//!
//! ## Components:
//!
//! - **`MetricsBuilder`**: The entry point for initializing the metrics system.
//!   It sets up the Prometheus recorder, binds the metrics listener, and
//!   constructs the `Metrics` handle.
//!
//! - **`Metrics`**: A lightweight, cloneable struct that serves as the public
//!   API for the application glue (API handlers, workers, reference reloads).
//!   Library components record their own series through the `metrics` macros.
//!
//! - **`MetricsServer`**: (Defined in `server.rs`) An `axum`-based web server
//!   that exposes the `/metrics` endpoint for Prometheus to scrape.

use crate::config::MetricsConfig;
use crate::internal_metrics::server::MetricsServer;
use metrics::{Counter, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::error;

/// The public API for the metrics system.
///
/// This struct holds cloneable handles to the metrics collectors.
#[derive(Clone)]
pub struct Metrics {
    pub events_rejected_total: Counter,
    /// Events refused because the queue was full.
    pub events_dropped_total: Counter,
    pub pipeline_failures_total: Counter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Creates a new `Metrics` instance and registers descriptions for all
    /// supported metrics with the global recorder.
    pub fn new() -> Self {
        // Descriptions (for Prometheus)
        metrics::describe_counter!("events_received_total", Unit::Count, "Total number of inbound events handed to the pipeline.");
        metrics::describe_counter!("events_rejected_total", Unit::Count, "Total number of inbound events rejected as invalid.");
        metrics::describe_counter!("events_dropped_total", Unit::Count, "Total number of inbound events refused because the queue was full.");
        metrics::describe_counter!("events_deduplicated_total", Unit::Count, "Total number of events suppressed as repeats within the deduplication window.");
        metrics::describe_counter!("pipeline_failures_total", Unit::Count, "Total number of events that could not be dispatched because a collaborator failed.");
        metrics::describe_counter!("subscribers_matched_total", Unit::Count, "Total number of subscriptions that matched an event.");
        metrics::describe_counter!("notifications_sent_total", Unit::Count, "Total number of accepted deliveries, labeled by channel.");
        metrics::describe_counter!("notifications_failed_total", Unit::Count, "Total number of failed deliveries, labeled by channel.");
        metrics::describe_counter!("invalid_push_tokens_total", Unit::Count, "Total number of push tokens reported as no longer registered.");
        metrics::describe_counter!("delivery_log_failures_total", Unit::Count, "Total number of delivery records that could not be written.");
        metrics::describe_counter!("rate_limit_denied_total", Unit::Count, "Total number of requests denied by the rate limiter.");
        metrics::describe_counter!("reference_reloads_total", Unit::Count, "Total number of reference data reloads, labeled by outcome.");
        metrics::describe_gauge!("events_queued", Unit::Count, "The current number of events waiting for a worker.");
        metrics::describe_gauge!("deduplication_cache_entries", Unit::Count, "The current number of events remembered by the deduplication cache.");
        metrics::describe_histogram!("dispatch_duration_seconds", Unit::Seconds, "The time taken to dispatch one event to all channels.");

        // Handles (for application use)
        Self {
            events_rejected_total: metrics::counter!("events_rejected_total"),
            events_dropped_total: metrics::counter!("events_dropped_total"),
            pipeline_failures_total: metrics::counter!("pipeline_failures_total"),
        }
    }

    /// Creates a `Metrics` instance that performs no operations.
    /// Used when metrics are disabled in the configuration.
    pub fn disabled() -> Self {
        Self {
            events_rejected_total: Counter::noop(),
            events_dropped_total: Counter::noop(),
            pipeline_failures_total: Counter::noop(),
        }
    }

    /// Increments the reload counter with `outcome` ("success" or "rejected").
    pub fn increment_reference_reload(&self, outcome: &'static str) {
        metrics::counter!("reference_reloads_total", "outcome" => outcome).increment(1);
    }

    /// Sets the gauge for the number of queued events.
    pub fn set_events_queued(&self, depth: usize) {
        metrics::gauge!("events_queued").set(depth as f64);
    }

    /// Creates a `Metrics` instance suitable for testing.
    ///
    /// Without an installed recorder the `metrics` macros are no-ops, so this
    /// needs no backend.
    pub fn new_for_test() -> Self {
        Self::new()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Builder for the metrics system.
///
/// This builder is responsible for initializing the `PrometheusRecorder`,
/// binding the metrics listener, and creating the `Metrics` handle.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    /// Creates a new `MetricsBuilder` with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Initializes the metrics system and returns a `Metrics` handle and an
    /// optional `MetricsServer` with its bound address.
    ///
    /// If metrics are disabled, or the recorder or listener cannot be set
    /// up, this returns a disabled `Metrics` instance and `None`.
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> (Metrics, Option<(MetricsServer, SocketAddr)>) {
        if !self.config.enabled {
            return (Metrics::disabled(), None);
        }

        let recorder = match PrometheusBuilder::new().set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        ) {
            Ok(builder) => builder.build_recorder(),
            Err(e) => {
                error!(error = %e, "Failed to configure Prometheus recorder");
                return (Metrics::disabled(), None);
            }
        };
        let handle = recorder.handle();

        // Bind the listener before installing the recorder so a bad address
        // leaves the process without a half-configured recorder.
        let listener = match TcpListener::bind(&self.config.listen_address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(address = %self.config.listen_address, error = %e, "Failed to bind metrics server");
                return (Metrics::disabled(), None);
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "Failed to get local address for metrics server");
                return (Metrics::disabled(), None);
            }
        };

        if let Err(e) = metrics::set_global_recorder(recorder) {
            error!(error = %e, "Failed to install Prometheus recorder");
            return (Metrics::disabled(), None);
        }

        let metrics = Metrics::new();
        let server = MetricsServer::new(listener, handle, shutdown_rx);
        (metrics, Some((server, addr)))
    }
}

pub mod server;
