//! SafeWatch - Environmental Safety Alerts
//!
//! Evaluates environmental measurements against regulatory thresholds and
//! notifies subscribers by email and push when a location becomes unsafe.

use anyhow::{Context, Result};
use clap::Parser;
use safewatch::{
    app::App,
    cli::{Cli, Command},
    config::Config,
    reference::ReferenceData,
    status::assess,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = Config::load(&cli).unwrap_or_else(|err| {
        eprintln!("Failed to load configuration: {:#}", err);
        std::process::exit(1);
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    // stdout carries `evaluate` results only.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Evaluate {
            substance,
            jurisdiction,
            value,
        } => evaluate(&config, &substance, &jurisdiction, value),
        Command::Serve => serve(config).await,
    }
}

fn evaluate(config: &Config, substance: &str, jurisdiction: &str, value: f64) -> Result<()> {
    let path = config
        .reference
        .data_path
        .as_ref()
        .context("reference.data_path must be set to evaluate a value")?;
    let reference = ReferenceData::from_path(path)?;
    let assessment = assess(&reference, substance, jurisdiction, value);
    println!(
        "{}\t{}",
        assessment.status,
        assessment.resolved_jurisdiction.as_deref().unwrap_or("-")
    );
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    info!("SafeWatch starting up...");
    log_config_summary(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = App::builder(config).build(shutdown_rx).await?;

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for the shutdown signal");
        }
        info!("Shutdown signal received. Shutting down gracefully...");
        let _ = shutdown_tx.send(true);
    });

    info!("SafeWatch initialized successfully. Waiting for events...");
    app.run().await?;
    info!("All tasks shut down. Exiting.");
    Ok(())
}

fn log_config_summary(config: &Config) {
    let enabled = |on: bool| if on { "Enabled" } else { "Disabled" };
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Worker Concurrency: {}", config.performance.worker_concurrency);
    info!("Event Queue Capacity: {}", config.performance.queue_capacity);
    match &config.reference.data_path {
        Some(path) => info!(
            "Reference Data: {} (hot reload {})",
            path.display(),
            enabled(config.reference.hot_reload)
        ),
        None => info!("Reference Data: Not configured"),
    }
    match &config.subscribers.directory_path {
        Some(path) => info!("Subscriber Directory: {}", path.display()),
        None => info!("Subscriber Directory: Not configured"),
    }
    info!("Email Channel: {}", enabled(config.notification.email.is_some()));
    info!("Push Channel: {}", enabled(config.notification.push.is_some()));
    info!("Channel Timeout: {}ms", config.notification.channel_timeout_ms);
    info!(
        "Untouched Preferences: {:?}",
        config.notification.untouched_preferences
    );
    match &config.notification.delivery_log_path {
        Some(path) => info!("Delivery Log: {}", path.display()),
        None => info!("Delivery Log: In memory"),
    }
    info!(
        "Rate Limit: {} requests per {}s",
        config.rate_limit.max_requests, config.rate_limit.window_seconds
    );
    info!(
        "Deduplication: {} (size {}, ttl {}s)",
        enabled(config.deduplication.enabled),
        config.deduplication.cache_size,
        config.deduplication.cache_ttl_seconds
    );
    if config.api.enabled {
        info!("API Listen Address: {}", config.api.listen_address);
    } else {
        info!("API: Disabled");
    }
    if config.metrics.enabled {
        info!("Metrics Listen Address: {}", config.metrics.listen_address);
    } else {
        info!("Metrics: Disabled");
    }
    info!("-------------------------------------------------------");
}
