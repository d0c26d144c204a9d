//! Matching and dispatching against fake channels, checking the aggregate
//! report and the delivery audit trail together.

use safewatch::{
    config::PushConfig,
    core::{Channel, DeliveryStatus, Preferences, SafetyStatus, Subscription, TriggerType},
    matching::{SubscriberMatcher, UntouchedPreferencePolicy},
    notification::{
        ChannelSendError, DeliveryLogger, DispatchSettings, ExpoPushSender, InMemoryDeliveryStore,
        JsonLinesDeliveryStore, NotificationDispatcher,
    },
    test_utils::{subscription, FakeEmailSender, FakePushSender},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::status_change;

fn dispatcher(
    matcher: SubscriberMatcher,
    email: Arc<FakeEmailSender>,
    push: Arc<FakePushSender>,
    store: InMemoryDeliveryStore,
) -> NotificationDispatcher {
    NotificationDispatcher::new(matcher, Arc::new(DeliveryLogger::new(Arc::new(store))))
        .with_email(email)
        .with_push(push)
}

#[tokio::test]
async fn test_untouched_preferences_only_hear_about_danger() {
    let subs = vec![subscription("sub-1", "springfield", Preferences::default())];
    let push = Arc::new(FakePushSender::new());
    let store = InMemoryDeliveryStore::new();
    let dispatcher = dispatcher(
        SubscriberMatcher::default(),
        Arc::new(FakeEmailSender::new()),
        push.clone(),
        store.clone(),
    );

    let warning = dispatcher
        .dispatch(&status_change("springfield", SafetyStatus::Safe, SafetyStatus::Warning), &subs)
        .await
        .unwrap();
    assert_eq!(warning.notified_count, 0);
    assert!(push.calls().is_empty());

    let danger = dispatcher
        .dispatch(&status_change("springfield", SafetyStatus::Warning, SafetyStatus::Danger), &subs)
        .await
        .unwrap();
    assert_eq!(danger.notified_count, 1);
    assert_eq!(danger.sent.push, 1);
    assert_eq!(push.calls().len(), 1);
}

#[tokio::test]
async fn test_untouched_preferences_can_be_silenced() {
    let subs = vec![subscription("sub-1", "springfield", Preferences::default())];
    let push = Arc::new(FakePushSender::new());
    let dispatcher = dispatcher(
        SubscriberMatcher::new(UntouchedPreferencePolicy::Nothing),
        Arc::new(FakeEmailSender::new()),
        push.clone(),
        InMemoryDeliveryStore::new(),
    );

    let report = dispatcher
        .dispatch(&status_change("springfield", SafetyStatus::Warning, SafetyStatus::Danger), &subs)
        .await
        .unwrap();

    assert_eq!(report.notified_count, 0);
    assert!(push.calls().is_empty());
}

#[tokio::test]
async fn test_failing_address_is_isolated_from_other_recipients_and_push() {
    // Five email subscribers, only the even ones also on push.
    let subs: Vec<Subscription> = (1..=5)
        .map(|i| {
            subscription(
                &format!("sub-{}", i),
                "springfield",
                Preferences {
                    enable_email: true,
                    enable_push: i % 2 == 0,
                    alert_on_danger: true,
                    ..Preferences::default()
                },
            )
        })
        .collect();
    let email = Arc::new(FakeEmailSender::new().failing_for("owner-3@example.com"));
    let push = Arc::new(FakePushSender::new());
    let store = InMemoryDeliveryStore::new();
    let dispatcher = dispatcher(SubscriberMatcher::default(), email.clone(), push.clone(), store.clone());

    let report = dispatcher
        .dispatch(&status_change("springfield", SafetyStatus::Safe, SafetyStatus::Danger), &subs)
        .await
        .unwrap();

    assert_eq!(report.sent.email, 4);
    assert_eq!(report.failed.email, 1);
    assert_eq!(report.sent.push, 2);
    assert_eq!(report.failed.push, 0);
    assert_eq!(report.notified_count, 5);
    assert_eq!(email.calls(), vec![(1..=5).map(|i| format!("owner-{}@example.com", i)).collect::<Vec<_>>()]);

    let records = store.records().await;
    assert_eq!(records.len(), 7);
    let failed: Vec<_> = records.iter().filter(|r| r.status == DeliveryStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].subscription_id, "sub-3");
    assert_eq!(failed[0].channel, Channel::Email);
    assert!(failed[0].error.is_some());
    assert!(records.iter().all(|r| r.trigger_type == TriggerType::StatusChange));
    assert!(records.iter().all(|r| r.title == records[0].title && r.body == records[0].body));
}

#[tokio::test]
async fn test_delivery_records_are_appended_as_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deliveries.jsonl");
    let subs = vec![subscription(
        "sub-1",
        "springfield",
        Preferences {
            enable_email: true,
            alert_on_any_change: true,
            ..Preferences::default()
        },
    )];
    let dispatcher = NotificationDispatcher::new(
        SubscriberMatcher::default(),
        Arc::new(DeliveryLogger::new(Arc::new(JsonLinesDeliveryStore::new(path.clone())))),
    )
    .with_email(Arc::new(FakeEmailSender::new()))
    .with_push(Arc::new(FakePushSender::new()));

    let event = status_change("springfield", SafetyStatus::Safe, SafetyStatus::Warning);
    dispatcher.dispatch(&event, &subs).await.unwrap();
    dispatcher.dispatch(&event, &subs).await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    // Two dispatches, each reaching email and push.
    assert_eq!(lines.len(), 4);
    let ids: std::collections::HashSet<_> = lines.iter().map(|l| l["id"].as_str().unwrap().to_string()).collect();
    assert_eq!(ids.len(), 4);
    assert!(lines.iter().all(|l| l["status"] == "sent"));
}

/// Accepts every message, taking `delay` before answering and far longer for
/// any request carrying `stalled_token`.
struct SlowProvider {
    delay: Duration,
    stalled_token: Option<&'static str>,
}

impl Respond for SlowProvider {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let messages: Vec<Value> = serde_json::from_slice(&request.body).unwrap();
        let stalled = self
            .stalled_token
            .is_some_and(|token| messages.iter().any(|m| m["to"] == token));
        let data: Vec<Value> = messages.iter().map(|_| json!({ "status": "ok" })).collect();
        ResponseTemplate::new(200)
            .set_body_json(json!({ "data": data }))
            .set_delay(if stalled { Duration::from_secs(3) } else { self.delay })
    }
}

async fn push_provider(responder: SlowProvider) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push/send"))
        .respond_with(responder)
        .mount(&server)
        .await;
    server
}

fn push_dispatcher(
    server: &MockServer,
    request_timeout: Duration,
    channel_timeout: Duration,
    store: InMemoryDeliveryStore,
) -> NotificationDispatcher {
    let config = PushConfig {
        endpoint: format!("{}/push/send", server.uri()),
        access_token: None,
        batch_size: 100,
        concurrency: 4,
    };
    NotificationDispatcher::new(SubscriberMatcher::default(), Arc::new(DeliveryLogger::new(Arc::new(store))))
        .with_push(Arc::new(ExpoPushSender::new(&config, request_timeout).unwrap()))
        .with_settings(DispatchSettings {
            channel_timeout,
            log_concurrency: 100,
        })
}

fn push_subscribers(count: usize) -> Vec<Subscription> {
    (0..count)
        .map(|i| subscription(&format!("sub-{}", i), "springfield", Preferences::default()))
        .collect()
}

#[tokio::test]
async fn test_large_push_batch_is_chunked_within_the_channel_timeout() {
    // Two chunks of 800 ms each would overrun 1.5 s if sent one after another.
    let server = push_provider(SlowProvider {
        delay: Duration::from_millis(800),
        stalled_token: None,
    })
    .await;
    let store = InMemoryDeliveryStore::new();
    let dispatcher = push_dispatcher(&server, Duration::from_secs(5), Duration::from_millis(1500), store.clone());

    let report = dispatcher
        .dispatch(
            &status_change("springfield", SafetyStatus::Warning, SafetyStatus::Danger),
            &push_subscribers(150),
        )
        .await
        .unwrap();

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert_eq!(report.sent.push, 150);
    assert_eq!(report.failed.push, 0);
    assert!(report.errors.is_empty());
    assert_eq!(store.records().await.len(), 150);
}

#[tokio::test]
async fn test_stalled_push_chunk_keeps_outcomes_of_accepted_chunks() {
    let server = push_provider(SlowProvider {
        delay: Duration::ZERO,
        stalled_token: Some("ExponentPushToken[sub-120]"),
    })
    .await;
    let store = InMemoryDeliveryStore::new();
    let dispatcher = push_dispatcher(&server, Duration::from_millis(500), Duration::from_secs(3), store.clone());

    let report = dispatcher
        .dispatch(
            &status_change("springfield", SafetyStatus::Warning, SafetyStatus::Danger),
            &push_subscribers(150),
        )
        .await
        .unwrap();

    assert_eq!(report.sent.push, 100);
    assert_eq!(report.failed.push, 50);
    assert!(report
        .errors
        .iter()
        .all(|e| matches!(e, ChannelSendError::Recipient { .. })));

    let records = store.records().await;
    let sent = records.iter().filter(|r| r.status == DeliveryStatus::Sent).count();
    assert_eq!(sent, 100);
    assert_eq!(records.len() - sent, 50);
}
