// src/tests/rate_limiter_tests.rs

use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

use crate::clock::ManualClock;
use crate::config::{RateLimitConfig, StrategyKind};
use crate::events::{EventBus, ResilienceEvent};
use crate::{ApiError, RateLimiter};

fn limiter() -> (RateLimiter, Arc<ManualClock>, EventBus) {
    let clock = Arc::new(ManualClock::new(0));
    let events = EventBus::default();
    (RateLimiter::new(clock.clone(), events.clone()), clock, events)
}

#[test]
fn test_configure_rejects_invalid_limits() {
    let (limiter, _, _) = limiter();

    let zero_limit = RateLimitConfig::new(
        "stripe",
        StrategyKind::TokenBucket,
        0,
        Duration::from_millis(1000),
    );
    assert!(matches!(
        limiter.configure(zero_limit),
        Err(ApiError::Config(_))
    ));

    let zero_window = RateLimitConfig::new("stripe", StrategyKind::FixedWindow, 5, Duration::ZERO);
    assert!(matches!(
        limiter.configure(zero_window),
        Err(ApiError::Config(_))
    ));

    assert!(limiter.configured_services().is_empty());
}

#[test]
fn test_delegates_to_configured_strategy() {
    let (limiter, _, _) = limiter();
    limiter
        .configure(RateLimitConfig::new(
            "github",
            StrategyKind::FixedWindow,
            2,
            Duration::from_secs(3600),
        ))
        .unwrap();

    assert!(limiter.can_make_request("github"));
    limiter.record_request("github");
    limiter.record_request("github");
    assert!(!limiter.can_make_request("github"));

    let status = limiter.status("github");
    assert_eq!(status.strategy_name, "fixed-window");
    assert_eq!(status.remaining_requests, 0);
    assert_eq!(limiter.wait_time("github"), Duration::from_secs(3600));
}

#[test]
fn test_reconfigure_discards_accumulated_state() {
    let (limiter, _, _) = limiter();
    let config = RateLimitConfig::new(
        "stripe",
        StrategyKind::SlidingWindow,
        1,
        Duration::from_secs(60),
    );

    limiter.configure(config.clone()).unwrap();
    limiter.record_request("stripe");
    assert!(!limiter.can_make_request("stripe"));

    limiter.configure(config).unwrap();
    assert!(limiter.can_make_request("stripe"));
}

#[test]
fn test_unconfigured_services_get_default_sliding_window() {
    let (limiter, clock, _) = limiter();

    let admitted = (0..15)
        .filter(|_| limiter.check_and_record("unknown").can_make_request)
        .count();
    assert_eq!(admitted, 10);
    assert_eq!(limiter.status("unknown").strategy_name, "sliding-window");

    clock.advance_millis(1000);
    assert!(limiter.can_make_request("unknown"));
}

#[test]
fn test_permissive_limiter_always_allows() {
    let limiter = RateLimiter::permissive(Arc::new(ManualClock::new(0)), EventBus::default());

    for _ in 0..1000 {
        assert!(limiter.check_and_record("anything").can_make_request);
    }
    assert_eq!(limiter.wait_time("anything"), Duration::ZERO);
}

#[test]
fn test_disabled_config_always_allows() {
    let (limiter, _, _) = limiter();
    let mut config = RateLimitConfig::new(
        "cloudinary",
        StrategyKind::TokenBucket,
        1,
        Duration::from_secs(60),
    );
    config.enabled = false;
    limiter.configure(config).unwrap();

    for _ in 0..50 {
        assert!(limiter.check_and_record("cloudinary").can_make_request);
    }
    assert_eq!(limiter.status("cloudinary").strategy_name, "disabled");
}

#[test]
fn test_reset_restores_capacity() {
    let (limiter, _, _) = limiter();
    limiter
        .configure(RateLimitConfig::new(
            "stripe",
            StrategyKind::TokenBucket,
            3,
            Duration::from_secs(60),
        ))
        .unwrap();

    for _ in 0..3 {
        limiter.record_request("stripe");
    }
    assert!(!limiter.can_make_request("stripe"));

    assert!(limiter.reset("stripe"));
    assert_eq!(limiter.status("stripe").remaining_requests, 3);
}

#[test]
fn test_remove_falls_back_to_default_policy() {
    let (limiter, _, _) = limiter();
    limiter
        .configure(RateLimitConfig::new(
            "stripe",
            StrategyKind::TokenBucket,
            100,
            Duration::from_secs(1),
        ))
        .unwrap();
    assert_eq!(limiter.configured_services(), vec!["stripe".to_string()]);

    limiter.remove("stripe");
    assert!(limiter.config("stripe").is_none());
    assert_eq!(limiter.status("stripe").strategy_name, "sliding-window");
}

#[tokio::test]
#[traced_test]
async fn test_notify_exceeded_publishes_event() {
    let (limiter, _, events) = limiter();
    let mut rx = events.subscribe();
    limiter
        .configure(RateLimitConfig::new(
            "stripe",
            StrategyKind::TokenBucket,
            5,
            Duration::from_millis(1000),
        ))
        .unwrap();

    for _ in 0..5 {
        limiter.record_request("stripe");
    }
    let wait = limiter.notify_exceeded("stripe");
    assert_eq!(wait, Duration::from_millis(200));

    match rx.recv().await.unwrap() {
        ResilienceEvent::RateLimitExceeded {
            service_id,
            wait_time_ms,
            ..
        } => {
            assert_eq!(service_id, "stripe");
            assert_eq!(wait_time_ms, 200);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert!(logs_contain("rate-limit-exceeded"));
}

// Test separate rate limits for different services
#[test]
fn test_services_are_isolated() {
    let (limiter, _, _) = limiter();
    for service in ["a", "b"] {
        limiter
            .configure(RateLimitConfig::new(
                service,
                StrategyKind::FixedWindow,
                1,
                Duration::from_secs(60),
            ))
            .unwrap();
    }

    assert!(limiter.check_and_record("a").can_make_request);
    assert!(!limiter.check_and_record("a").can_make_request);
    assert!(limiter.check_and_record("b").can_make_request);
}
