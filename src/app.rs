//! The main application logic, decoupled from the entry point.

use crate::{
    api::{ApiServer, ApiState},
    config::Config,
    core::{DeliveryStore, EmailResolver, EmailSender, PushSender, SubscriberStore},
    deduplication::Deduplicator,
    internal_metrics::{Metrics, MetricsBuilder},
    matching::SubscriberMatcher,
    notification::{
        DeliveryLogger, DispatchSettings, ExpoPushSender, HttpEmailSender, InMemoryDeliveryStore,
        JsonLinesDeliveryStore, NotificationDispatcher,
    },
    pipeline::{AlertPipeline, IngestEvent, PipelineError},
    rate_limit::RateLimiter,
    reference::{ReferenceData, ReferenceStore},
    subscribers::{InMemorySubscriberStore, SubscriberDirectory},
    task_manager::TaskManager,
};
use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

/// A handle to the running application.
pub struct App {
    task_manager: TaskManager,
    events_tx: Sender<IngestEvent>,
    reference: ReferenceStore,
    api_addr: Option<SocketAddr>,
    metrics_addr: Option<SocketAddr>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn reference(&self) -> &ReferenceStore {
        &self.reference
    }

    /// Sender side of the event queue, for in-process event sources.
    pub fn events_tx(&self) -> Sender<IngestEvent> {
        self.events_tx.clone()
    }

    /// Waits for the shutdown signal and then gracefully shuts down all tasks.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.get_shutdown_rx();
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        info!("Shutdown signal received. Waiting for tasks to complete...");

        self.events_tx.close();
        self.task_manager.shutdown().await;

        info!("All tasks shut down.");
        Ok(())
    }
}

/// Builder for the main application.
///
/// Separates constructing the components from running them, and lets tests
/// replace any external collaborator.
pub struct AppBuilder {
    config: Config,
    email_sender_override: Option<Arc<dyn EmailSender>>,
    push_sender_override: Option<Arc<dyn PushSender>>,
    subscriber_store_override: Option<Arc<dyn SubscriberStore>>,
    email_resolver_override: Option<Arc<dyn EmailResolver>>,
    delivery_store_override: Option<Arc<dyn DeliveryStore>>,
    reference_override: Option<ReferenceData>,
    metrics_override: Option<Metrics>,
    shutdown_grace: Option<Duration>,
}

impl AppBuilder {
    /// Creates a new `AppBuilder` with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            email_sender_override: None,
            push_sender_override: None,
            subscriber_store_override: None,
            email_resolver_override: None,
            delivery_store_override: None,
            reference_override: None,
            metrics_override: None,
            shutdown_grace: None,
        }
    }

    /// Overrides the email channel for testing.
    pub fn email_sender_override(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email_sender_override = Some(sender);
        self
    }

    /// Overrides the push channel for testing.
    pub fn push_sender_override(mut self, sender: Arc<dyn PushSender>) -> Self {
        self.push_sender_override = Some(sender);
        self
    }

    /// Overrides the subscriber store. Invalid push tokens are then only
    /// logged, not cleared.
    pub fn subscriber_store_override(mut self, store: Arc<dyn SubscriberStore>) -> Self {
        self.subscriber_store_override = Some(store);
        self
    }

    pub fn email_resolver_override(mut self, resolver: Arc<dyn EmailResolver>) -> Self {
        self.email_resolver_override = Some(resolver);
        self
    }

    pub fn delivery_store_override(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.delivery_store_override = Some(store);
        self
    }

    /// Uses `data` instead of loading `reference.data_path`. Disables hot reload.
    pub fn reference_override(mut self, data: ReferenceData) -> Self {
        self.reference_override = Some(data);
        self
    }

    /// Overrides the metrics system for testing.
    pub fn metrics_override(mut self, metrics: Metrics) -> Self {
        self.metrics_override = Some(metrics);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Builds and initializes all application components, returning a runnable `App`.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;
        let mut task_manager = TaskManager::new(shutdown_rx.clone());
        if let Some(grace) = self.shutdown_grace {
            task_manager = task_manager.with_grace(grace);
        }

        // =========================================================================
        // 1. Initialize Metrics
        // =========================================================================
        let (metrics, metrics_server_info) = match self.metrics_override {
            Some(m) => (m, None),
            None => MetricsBuilder::new(config.metrics.clone()).build(shutdown_rx.clone()).await,
        };
        let metrics = Arc::new(metrics);
        let metrics_addr = metrics_server_info.map(|(server, addr)| {
            info!(address = %addr, "Metrics server listening");
            task_manager.spawn("MetricsServer", server.run());
            addr
        });

        // =========================================================================
        // 2. Reference Data
        // =========================================================================
        let reference = match (self.reference_override, &config.reference.data_path) {
            (Some(data), _) => ReferenceStore::new(data),
            (None, Some(path)) => {
                let store = ReferenceStore::from_path(path)?;
                if config.reference.hot_reload {
                    store.watch(path.clone(), &task_manager, metrics.clone(), None)?;
                }
                store
            }
            (None, None) => {
                warn!("No reference data configured; every measurement will evaluate as danger");
                ReferenceStore::new(ReferenceData::default())
            }
        };

        // =========================================================================
        // 3. Subscribers
        // =========================================================================
        let (subscribers, directory_resolver, token_cleanup): (
            Arc<dyn SubscriberStore>,
            Option<Arc<dyn EmailResolver>>,
            Option<Arc<InMemorySubscriberStore>>,
        ) = match (self.subscriber_store_override, &config.subscribers.directory_path) {
            (Some(store), _) => (store, None, None),
            (None, Some(path)) => {
                let (store, resolver) = SubscriberDirectory::from_path(path)?.into_parts();
                let store = Arc::new(store);
                let resolver: Arc<dyn EmailResolver> = Arc::new(resolver);
                (store.clone(), Some(resolver), Some(store))
            }
            (None, None) => {
                warn!("No subscriber directory configured");
                let store = Arc::new(InMemorySubscriberStore::new());
                (store.clone(), None, Some(store))
            }
        };
        let resolver = self.email_resolver_override.or(directory_resolver);

        // =========================================================================
        // 4. Notification Channels & Dispatcher
        // =========================================================================
        let notification = &config.notification;
        let delivery_store: Arc<dyn DeliveryStore> = match (self.delivery_store_override, &notification.delivery_log_path)
        {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonLinesDeliveryStore::new(path.clone())),
            (None, None) => Arc::new(InMemoryDeliveryStore::new()),
        };

        let email_sender: Option<Arc<dyn EmailSender>> = match (self.email_sender_override, &notification.email) {
            (Some(sender), _) => Some(sender),
            (None, Some(email)) => Some(Arc::new(
                HttpEmailSender::new(email, notification.request_timeout()).context("Failed to build email sender")?,
            )),
            (None, None) => None,
        };
        let push_sender: Option<Arc<dyn PushSender>> = match (self.push_sender_override, &notification.push) {
            (Some(sender), _) => Some(sender),
            (None, Some(push)) => Some(Arc::new(
                ExpoPushSender::new(push, notification.request_timeout()).context("Failed to build push sender")?,
            )),
            (None, None) => None,
        };
        if email_sender.is_none() && push_sender.is_none() {
            warn!("No notification channel configured; events will be matched but not delivered");
        }

        let mut dispatcher = NotificationDispatcher::new(
            SubscriberMatcher::new(notification.untouched_preferences),
            Arc::new(DeliveryLogger::new(delivery_store)),
        )
        .with_settings(DispatchSettings {
            channel_timeout: notification.channel_timeout(),
            log_concurrency: notification.log_concurrency,
        })
        .with_shutdown(task_manager.get_shutdown_rx());
        if let Some(sender) = email_sender {
            dispatcher = dispatcher.with_email(sender);
        }
        if let Some(sender) = push_sender {
            dispatcher = dispatcher.with_push(sender);
        }
        if let Some(resolver) = resolver {
            dispatcher = dispatcher.with_resolver(resolver);
        }

        // =========================================================================
        // 5. Pipeline & Workers
        // =========================================================================
        let mut pipeline = AlertPipeline::new(reference.clone(), subscribers, Arc::new(dispatcher));
        if config.deduplication.enabled {
            pipeline = pipeline.with_deduplicator(Arc::new(Deduplicator::new(
                Duration::from_secs(config.deduplication.cache_ttl_seconds),
                config.deduplication.cache_size,
            )));
        }
        let pipeline = Arc::new(pipeline);

        let (events_tx, events_rx) = async_channel::bounded(config.performance.queue_capacity);
        let worker_concurrency = config.performance.worker_concurrency;
        info!("Spawning {} event worker tasks...", worker_concurrency);
        for i in 0..worker_concurrency {
            task_manager.spawn(
                "EventWorker",
                run_worker(
                    i,
                    events_rx.clone(),
                    pipeline.clone(),
                    token_cleanup.clone(),
                    metrics.clone(),
                    task_manager.get_shutdown_rx(),
                ),
            );
        }

        // =========================================================================
        // 6. HTTP API
        // =========================================================================
        let api_addr = if config.api.enabled {
            let listener = TcpListener::bind(&config.api.listen_address)
                .await
                .with_context(|| format!("Failed to bind API listener on {}", config.api.listen_address))?;
            let addr = listener.local_addr()?;
            let state = ApiState {
                events_tx: events_tx.clone(),
                rate_limiter: RateLimiter::from_config(&config.rate_limit),
                reference: reference.clone(),
                metrics: metrics.clone(),
            };
            task_manager.spawn("ApiServer", ApiServer::new(listener, state, task_manager.get_shutdown_rx()).run());
            info!(address = %addr, "API listening");
            Some(addr)
        } else {
            None
        };

        Ok(App {
            task_manager,
            events_tx,
            reference,
            api_addr,
            metrics_addr,
        })
    }
}

/// Pulls events off the queue until shutdown or until the queue closes.
///
/// An event already being processed when shutdown is signalled runs to
/// completion; the dispatcher itself stops writing delivery records.
async fn run_worker(
    id: usize,
    events_rx: Receiver<IngestEvent>,
    pipeline: Arc<AlertPipeline>,
    token_cleanup: Option<Arc<InMemorySubscriberStore>>,
    metrics: Arc<Metrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    trace!("Event worker {} started", id);
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                trace!("Event worker {} received shutdown signal, exiting.", id);
                None
            }
            event = events_rx.recv() => event.ok(),
        };
        let Some(event) = event else {
            break;
        };
        metrics.set_events_queued(events_rx.len());

        match pipeline.process(&event).await {
            Ok(Some(report)) => {
                if report.invalid_tokens.is_empty() {
                    continue;
                }
                match &token_cleanup {
                    Some(store) => {
                        for token in &report.invalid_tokens {
                            let cleared = store.clear_push_token(token).await;
                            debug!(cleared, "Cleared unregistered push token");
                        }
                    }
                    None => info!(
                        count = report.invalid_tokens.len(),
                        "Push service reported unregistered tokens"
                    ),
                }
            }
            Ok(None) => {}
            // Already counted and logged by the pipeline.
            Err(PipelineError::Validation(_)) => {}
            Err(e @ PipelineError::Subscribers { .. }) => {
                metrics.pipeline_failures_total.increment(1);
                error!(error = ?e, "Event could not be dispatched");
            }
        }
    }
    trace!("Event worker {} finished.", id);
}
