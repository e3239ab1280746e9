// src/resilience/tests/exponential_backoff_tests.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ApiError;
use crate::resilience::{retry_with_backoff, ExponentialBackoff, RetryConfig};

fn fixed(max_attempts: usize, initial_ms: u64, max_ms: u64) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff: Duration::from_millis(initial_ms),
        max_backoff: Duration::from_millis(max_ms),
        backoff_multiplier: 2.0,
        use_jitter: false,
    }
}

#[test]
fn test_backoff_grows_then_caps() {
    let mut backoff = ExponentialBackoff::new(fixed(5, 100, 300));

    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
    // 400ms capped
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
    assert_eq!(backoff.next_backoff(), None);
}

#[test]
fn test_fractional_multiplier_rounds_to_whole_millis() {
    let mut backoff = ExponentialBackoff::new(RetryConfig {
        backoff_multiplier: 1.5,
        ..fixed(4, 100, 300)
    });

    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(150)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(225)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
}

#[test]
fn test_initial_backoff_above_cap_is_capped() {
    let mut backoff = ExponentialBackoff::new(fixed(2, 5_000, 1_000));

    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1_000)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1_000)));
}

#[test]
fn test_jitter_stays_within_half_to_full() {
    let mut backoff = ExponentialBackoff::new(RetryConfig {
        use_jitter: true,
        ..fixed(3, 100, 10_000)
    });

    for expected_ms in [100u64, 200, 400] {
        let delay = backoff.next_backoff().unwrap();
        assert!(
            delay >= Duration::from_millis(expected_ms / 2) && delay <= Duration::from_millis(expected_ms),
            "{:?} outside [{}ms, {}ms]",
            delay,
            expected_ms / 2,
            expected_ms
        );
    }
}

#[test]
fn test_reset_restarts_sequence() {
    let mut backoff = ExponentialBackoff::new(fixed(2, 50, 1_000));

    backoff.next_backoff();
    backoff.next_backoff();
    assert_eq!(backoff.next_backoff(), None);
    assert_eq!(backoff.attempts(), 3);

    backoff.reset();
    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(50)));
}

#[test]
fn test_zero_attempts_never_retries() {
    let mut backoff = ExponentialBackoff::new(fixed(0, 100, 1_000));
    assert_eq!(backoff.next_backoff(), None);
}

#[test]
fn test_delay_honours_longer_retry_hint() {
    let mut backoff = ExponentialBackoff::new(fixed(3, 100, 1_000));

    let limited = ApiError::RateLimitExceeded {
        service_id: "api".to_string(),
        wait_time: Duration::from_millis(750),
    };
    assert_eq!(backoff.next_delay_for(&limited), Some(Duration::from_millis(750)));

    // A hint shorter than the backoff does not shorten it
    let short = ApiError::RateLimitExceeded {
        service_id: "api".to_string(),
        wait_time: Duration::from_millis(10),
    };
    assert_eq!(backoff.next_delay_for(&short), Some(Duration::from_millis(200)));

    let failed = ApiError::operation_failed("api", "boom");
    assert_eq!(backoff.next_delay_for(&failed), Some(Duration::from_millis(400)));
    assert_eq!(backoff.next_delay_for(&failed), None);
}

#[test]
fn test_retry_config_parses_millis() {
    let config: RetryConfig = serde_json::from_str(
        r#"{
            "maxAttempts": 4,
            "initialBackoffMs": 250,
            "maxBackoffMs": 2000,
            "backoffMultiplier": 1.5,
            "useJitter": false
        }"#,
    )
    .unwrap();

    assert_eq!(config.max_attempts, 4);
    assert_eq!(config.initial_backoff, Duration::from_millis(250));
    assert_eq!(config.max_backoff, Duration::from_secs(2));
    assert!(!config.use_jitter);
}

#[tokio::test]
async fn test_retry_succeeds_after_transient_failures() {
    let attempts = AtomicUsize::new(0);
    let counter = &attempts;

    let result = retry_with_backoff(fixed(3, 5, 50), move || async move {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            Err(ApiError::OperationFailed {
                service_id: "api".to_string(),
                status: Some(503),
                message: "unavailable".to_string(),
            })
        } else {
            Ok(attempt)
        }
    })
    .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    let attempts = AtomicUsize::new(0);
    let counter = &attempts;

    let result: crate::Result<()> = retry_with_backoff(fixed(2, 5, 50), move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(ApiError::operation_failed("api", "still down"))
    })
    .await;

    assert!(matches!(result, Err(ApiError::OperationFailed { .. })));
    // first attempt plus two retries
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_open_circuit_and_client_errors_are_not_retried() {
    let attempts = AtomicUsize::new(0);
    let counter = &attempts;
    let started = Instant::now();

    let result: crate::Result<()> = retry_with_backoff(fixed(5, 100, 1_000), move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(ApiError::CircuitOpen {
            service_id: "api".to_string(),
            retry_after: Duration::from_secs(30),
        })
    })
    .await;

    assert!(matches!(result, Err(ApiError::CircuitOpen { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(100));

    attempts.store(0, Ordering::SeqCst);
    let result: crate::Result<()> = retry_with_backoff(fixed(5, 100, 1_000), move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(ApiError::OperationFailed {
            service_id: "api".to_string(),
            status: Some(404),
            message: "not found".to_string(),
        })
    })
    .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
