//! The assembled service: HTTP ingest, worker pool, dispatch and cleanup.

use safewatch::{
    app::App,
    core::{Preferences, SubscriberStore},
    notification::InMemoryDeliveryStore,
    subscribers::InMemorySubscriberStore,
    test_utils::{subscription, FakeEmailSender, FakePushSender},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::{
    app::{spawn, test_config, wait_until},
    measurement, reference, temp_file, REFERENCE_YAML,
};

const SUBSCRIBERS_YAML: &str = r#"
subscriptions:
  - id: sub-1
    owner_id: owner-1
    location_key: springfield
    preferences:
      enable_email: true
      alert_on_danger: true
    push_token: ExponentPushToken[one]
  - id: sub-2
    owner_id: owner-2
    location_key: springfield
    push_token: ExponentPushToken[two]
owners:
  owner-1: one@example.com
"#;

#[tokio::test]
async fn test_event_posted_to_api_is_delivered() {
    let reference_file = temp_file(REFERENCE_YAML, ".yaml");
    let subscribers_file = temp_file(SUBSCRIBERS_YAML, ".yaml");
    let mut config = test_config();
    config.reference.data_path = Some(reference_file.path().to_path_buf());
    config.subscribers.directory_path = Some(subscribers_file.path().to_path_buf());

    let email = Arc::new(FakeEmailSender::new());
    let push = Arc::new(FakePushSender::new());
    let deliveries = InMemoryDeliveryStore::new();
    let (email_c, push_c, deliveries_c) = (email.clone(), push.clone(), deliveries.clone());
    let app = spawn(
        move |config| {
            App::builder(config)
                .email_sender_override(email_c)
                .push_sender_override(push_c)
                .delivery_store_override(Arc::new(deliveries_c))
        },
        config,
    )
    .await
    .unwrap();

    let response = reqwest::Client::new()
        .post(app.api_url("/events"))
        .json(&json!({
            "kind": "measurement",
            "jurisdiction_code": "US",
            "current": {
                "substance_id": "lead",
                "location_key": "springfield",
                "value": 40.0,
                "measured_at": "2026-03-01T12:00:00Z"
            },
            "previous_value": 4.0
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    assert!(wait_until(Duration::from_secs(5), || async { deliveries.records().await.len() == 3 }).await);
    // The owner directory supplies sub-1's address; sub-2 has no email enabled.
    assert_eq!(email.calls(), vec![vec!["one@example.com".to_string()]]);
    assert_eq!(push.calls().len(), 1);
    assert_eq!(push.calls()[0].len(), 2);

    app.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_unregistered_token_is_cleared_from_directory() {
    let subscribers_file = temp_file(SUBSCRIBERS_YAML, ".yaml");
    let mut config = test_config();
    config.api.enabled = false;
    config.subscribers.directory_path = Some(subscribers_file.path().to_path_buf());

    let push = Arc::new(FakePushSender::new().unregistered("ExponentPushToken[two]"));
    let push_c = push.clone();
    let app = spawn(
        move |config| App::builder(config).reference_override(reference()).push_sender_override(push_c),
        config,
    )
    .await
    .unwrap();

    let event = measurement("springfield", "US", "lead", 40.0, Some(4.0));
    app.send(event.clone()).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { push.calls().len() == 1 }).await);

    // Let the worker finish the cleanup, then a fresh event no longer
    // addresses the dead token. A different value avoids deduplication.
    tokio::time::sleep(Duration::from_millis(100)).await;
    app.send(measurement("springfield", "US", "lead", 41.0, Some(4.0)))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { push.calls().len() == 2 }).await);
    assert_eq!(push.calls()[1], vec!["ExponentPushToken[one]".to_string()]);

    app.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_health_reports_loaded_reference_data() {
    let config = test_config();
    let store = Arc::new(InMemorySubscriberStore::from_subscriptions(vec![subscription(
        "sub-1",
        "springfield",
        Preferences::default(),
    )]));
    assert_eq!(store.subscriptions_for("springfield").await.unwrap().len(), 1);

    let app = spawn(
        move |config| {
            App::builder(config)
                .reference_override(reference())
                .subscriber_store_override(store)
        },
        config,
    )
    .await
    .unwrap();

    let body: serde_json::Value = reqwest::get(app.api_url("/health")).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["reference"]["substances"], 5);
    assert_eq!(body["reference"]["jurisdictions"], 4);
    assert_eq!(body["reference"]["thresholds"], 6);

    app.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_sign_in_requests_share_the_configured_limit() {
    let mut config = test_config();
    config.rate_limit.max_requests = 1;
    let app = spawn(|config| App::builder(config), config).await.unwrap();
    let client = reqwest::Client::new();
    let body = json!({ "identity": "someone@example.com" });

    let first = client.post(app.api_url("/sign-in-requests")).json(&body).send().await.unwrap();
    let second = client.post(app.api_url("/sign-in-requests")).json(&body).send().await.unwrap();

    assert_eq!(first.status(), reqwest::StatusCode::ACCEPTED);
    assert_eq!(second.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));

    app.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_unreadable_reference_file_fails_startup() {
    let mut config = test_config();
    config.reference.data_path = Some("/nonexistent/reference.yaml".into());
    let (_tx, rx) = tokio::sync::watch::channel(false);

    let result = App::builder(config).build(rx).await;

    assert!(result.is_err());
}
