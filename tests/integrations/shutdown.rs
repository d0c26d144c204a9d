//! Graceful shutdown of the assembled service.

use safewatch::{
    app::App,
    notification::InMemoryDeliveryStore,
    test_utils::{FakeEmailSender, FakePushSender},
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::{
    app::{spawn, test_config, wait_until},
    measurement, reference, temp_file,
};

const SUBSCRIBERS_YAML: &str = r#"
subscriptions:
  - id: sub-1
    owner_id: owner-1
    location_key: springfield
    email: one@example.com
    preferences:
      enable_email: true
      alert_on_danger: true
"#;

#[tokio::test]
async fn test_idle_app_stops_promptly() {
    let app = spawn(|config| App::builder(config).reference_override(reference()), test_config())
        .await
        .unwrap();

    let started = Instant::now();
    app.shutdown(Duration::from_secs(5)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_in_flight_send_completes_but_is_not_logged_after_shutdown() {
    let subscribers_file = temp_file(SUBSCRIBERS_YAML, ".yaml");
    let mut config = test_config();
    config.api.enabled = false;
    config.subscribers.directory_path = Some(subscribers_file.path().to_path_buf());

    let email = Arc::new(FakeEmailSender::new().with_delay(Duration::from_millis(300)));
    let deliveries = InMemoryDeliveryStore::new();
    let (email_c, deliveries_c) = (email.clone(), deliveries.clone());
    let app = spawn(
        move |config| {
            App::builder(config)
                .reference_override(reference())
                .email_sender_override(email_c)
                .push_sender_override(Arc::new(FakePushSender::new()))
                .delivery_store_override(Arc::new(deliveries_c))
        },
        config,
    )
    .await
    .unwrap();

    app.send(measurement("springfield", "US", "lead", 40.0, Some(1.0)))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { email.calls().len() == 1 }).await);

    app.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(email.calls().len(), 1);
    assert!(deliveries.records().await.is_empty());
}
