use clap::Parser;
use safewatch::{cli::Cli, config::Config, matching::UntouchedPreferencePolicy};
use serial_test::serial;
use std::path::PathBuf;

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::temp_file;

const FULL_CONFIG: &str = r#"
log_level = "debug"

[performance]
worker_concurrency = 4
queue_capacity = 500

[reference]
data_path = "/etc/safewatch/reference.yaml"
hot_reload = false

[subscribers]
directory_path = "/etc/safewatch/subscribers.yaml"

[notification]
untouched_preferences = "nothing"
channel_timeout_ms = 2500
delivery_log_path = "/var/log/safewatch/deliveries.jsonl"

[notification.email]
endpoint = "https://mail.example.com/send"
from_address = "alerts@example.com"

[notification.push]
access_token = "secret"
batch_size = 50

[rate_limit]
window_seconds = 600
max_requests = 5

[deduplication]
enabled = false
cache_ttl_seconds = 120

[api]
listen_address = "0.0.0.0:8088"
"#;

#[test]
#[serial]
fn test_load_full_valid_config() {
    let file = temp_file(FULL_CONFIG, ".toml");

    let config = Config::load_from_path(file.path()).unwrap();

    assert_eq!(config.log_level, "debug");
    assert_eq!(config.performance.worker_concurrency, 4);
    assert_eq!(config.performance.queue_capacity, 500);
    assert_eq!(
        config.reference.data_path,
        Some(PathBuf::from("/etc/safewatch/reference.yaml"))
    );
    assert!(!config.reference.hot_reload);
    assert_eq!(
        config.subscribers.directory_path,
        Some(PathBuf::from("/etc/safewatch/subscribers.yaml"))
    );
    assert_eq!(config.notification.untouched_preferences, UntouchedPreferencePolicy::Nothing);
    assert_eq!(config.notification.channel_timeout().as_millis(), 2500);
    // Unset keys keep their defaults.
    assert_eq!(config.notification.log_concurrency, 100);

    let email = config.notification.email.unwrap();
    assert_eq!(email.from_address, "alerts@example.com");
    assert_eq!(email.concurrency, 16);
    let push = config.notification.push.unwrap();
    assert_eq!(push.batch_size, 50);
    assert_eq!(push.endpoint, "https://exp.host/--/api/v2/push/send");

    assert_eq!(config.rate_limit.window_seconds, 600);
    assert_eq!(config.rate_limit.max_requests, 5);
    assert_eq!(config.rate_limit.max_identities, 100_000);
    assert!(!config.deduplication.enabled);
    assert_eq!(config.deduplication.cache_ttl_seconds, 120);
    assert_eq!(config.api.listen_address, "0.0.0.0:8088");
    assert!(!config.metrics.enabled);
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();

    let config = Config::load_from_path(&dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.log_level, "info");
    assert!(config.notification.email.is_none());
    assert!(config.notification.push.is_none());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = temp_file(FULL_CONFIG, ".toml");
    std::env::set_var("SAFEWATCH_RATE_LIMIT__MAX_REQUESTS", "9");
    std::env::set_var("SAFEWATCH_LOG_LEVEL", "warn");

    let result = Config::load_from_path(file.path());

    std::env::remove_var("SAFEWATCH_RATE_LIMIT__MAX_REQUESTS");
    std::env::remove_var("SAFEWATCH_LOG_LEVEL");
    let config = result.unwrap();
    assert_eq!(config.rate_limit.max_requests, 9);
    assert_eq!(config.log_level, "warn");
}

#[test]
#[serial]
fn test_cli_overrides_file_and_environment() {
    let file = temp_file(FULL_CONFIG, ".toml");
    std::env::set_var("SAFEWATCH_LOG_LEVEL", "warn");
    let cli = Cli::try_parse_from([
        "safewatch",
        "--config",
        file.path().to_str().unwrap(),
        "--log-level",
        "trace",
        "--listen",
        "127.0.0.1:7000",
        "--metrics-listen",
        "127.0.0.1:9100",
    ])
    .unwrap();

    let result = Config::load(&cli);

    std::env::remove_var("SAFEWATCH_LOG_LEVEL");
    let config = result.unwrap();
    assert_eq!(config.log_level, "trace");
    assert_eq!(config.api.listen_address, "127.0.0.1:7000");
    assert!(config.metrics.enabled);
    assert_eq!(config.metrics.listen_address, "127.0.0.1:9100");
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    let file = temp_file("[performance]\nworker_concurrency = 0\n", ".toml");
    assert!(Config::load_from_path(file.path()).is_err());

    let file = temp_file("[notification.push]\nbatch_size = 500\n", ".toml");
    assert!(Config::load_from_path(file.path()).is_err());

    let file = temp_file("[rate_limit]\nmax_requests = \"many\"\n", ".toml");
    assert!(Config::load_from_path(file.path()).is_err());
}
