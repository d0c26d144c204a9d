//! Fixed-window rate limiting with a controllable clock.

use chrono::{TimeZone, Utc};
use safewatch::{
    rate_limit::{MokaRateLimitStore, RateLimitError, RateLimiter},
    test_utils::ManualClock,
};
use std::sync::Arc;
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(15 * 60);

fn limiter(clock: Arc<ManualClock>, max_requests: u32) -> RateLimiter {
    RateLimiter::new(Arc::new(MokaRateLimitStore::new(WINDOW, 1_000)), WINDOW, max_requests).with_clock(clock)
}

#[tokio::test]
async fn test_three_requests_per_fifteen_minutes() {
    let start = Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let limiter = limiter(clock.clone(), 3);

    for _ in 0..3 {
        let decision = limiter.check("user@example.com").await.unwrap();
        assert!(decision.allowed);
        limiter.record("user@example.com").await.unwrap();
        clock.advance(chrono::Duration::minutes(2));
    }

    let denied = limiter.check("user@example.com").await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.reset_at, Some(start + chrono::Duration::minutes(15)));

    clock.advance(chrono::Duration::minutes(10));
    assert!(limiter.check("user@example.com").await.unwrap().allowed);
}

#[tokio::test]
async fn test_identities_do_not_share_a_window() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = limiter(clock, 1);

    limiter.try_acquire("a@example.com").await.unwrap();

    assert!(matches!(
        limiter.try_acquire("A@example.com ").await,
        Err(RateLimitError::Exceeded { .. })
    ));
    assert!(limiter.try_acquire("b@example.com").await.is_ok());
}

#[tokio::test]
async fn test_concurrent_acquires_never_exceed_the_cap() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = limiter(clock, 3);

    let attempts = (0..20).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.try_acquire("user@example.com").await.is_ok() })
    });
    let admitted = futures::future::join_all(attempts)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    assert_eq!(admitted, 3);
}

#[tokio::test]
async fn test_zero_cap_denies_everything() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = limiter(clock, 0);

    assert!(!limiter.check("user@example.com").await.unwrap().allowed);
    assert!(limiter.try_acquire("user@example.com").await.is_err());
}
