// src/algorithms/tests/mod.rs




/// Common tests for all algorithms
mod common_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::algorithms::{build_strategy, RateLimitStrategy};
    use crate::clock::ManualClock;
    use crate::config::{RateLimitConfig, StrategyKind};

    fn all_strategies(clock: &Arc<ManualClock>) -> Vec<Arc<dyn RateLimitStrategy>> {
        [
            StrategyKind::TokenBucket,
            StrategyKind::SlidingWindow,
            StrategyKind::FixedWindow,
        ]
        .into_iter()
        .map(|kind| {
            let config = RateLimitConfig::new("svc", kind, 5, Duration::from_secs(60));
            build_strategy(&config, clock.clone())
        })
        .collect()
    }

    /// Test consistent behavior across all algorithm implementations
    #[test]
    fn test_algorithm_trait_consistency() {
        let clock = Arc::new(ManualClock::new(0));

        for strategy in all_strategies(&clock) {
            let name = strategy.name();

            // Unknown services start with full capacity
            let status = strategy.status("fresh");
            assert!(status.can_make_request, "{}: fresh service allowed", name);
            assert_eq!(status.remaining_requests, 5, "{}: full capacity", name);
            assert_eq!(status.wait_time, Duration::ZERO, "{}: no wait", name);

            for i in 0..5 {
                assert!(
                    strategy.can_make_request(name),
                    "{}: request {} should be allowed",
                    name,
                    i
                );
                strategy.record_request(name);
            }

            assert!(!strategy.can_make_request(name), "{}: 6th denied", name);
            assert!(strategy.wait_time(name) > Duration::ZERO, "{}: must wait", name);

            // Key isolation
            assert!(
                strategy.can_make_request(&format!("{}_other", name)),
                "{}: different service should be allowed",
                name
            );
        }
    }

    /// Recording past exhaustion never drives capacity below zero
    #[test]
    fn test_record_request_is_defensive_when_exhausted() {
        let clock = Arc::new(ManualClock::new(0));

        for strategy in all_strategies(&clock) {
            for _ in 0..20 {
                strategy.record_request("svc");
            }
            let status = strategy.status("svc");
            assert_eq!(status.remaining_requests, 0, "{}", strategy.name());
            assert!(!status.can_make_request, "{}", strategy.name());
        }
    }

    /// Reset restores full capacity regardless of history, and is idempotent
    #[test]
    fn test_idempotent_reset() {
        let clock = Arc::new(ManualClock::new(0));

        for strategy in all_strategies(&clock) {
            for _ in 0..5 {
                strategy.record_request("svc");
            }
            assert!(!strategy.can_make_request("svc"));

            let resettable = strategy
                .as_resettable()
                .expect("built-in strategies support reset");
            resettable.reset("svc");
            resettable.reset("svc");
            resettable.reset("never-seen");

            let status = strategy.status("svc");
            assert!(status.can_make_request, "{}", strategy.name());
            assert_eq!(status.remaining_requests, 5, "{}", strategy.name());
        }
    }

    /// check_and_record admits exactly `limit` requests
    #[test]
    fn test_check_and_record_counts_admissions() {
        let clock = Arc::new(ManualClock::new(0));

        for strategy in all_strategies(&clock) {
            let admitted = (0..8)
                .filter(|_| strategy.check_and_record("svc").can_make_request)
                .count();
            assert_eq!(admitted, 5, "{}", strategy.name());
        }
    }

    /// No update is lost when many threads record at once
    #[test]
    fn test_concurrent_recording_loses_no_updates() {
        let clock = Arc::new(ManualClock::new(0));

        for kind in [
            StrategyKind::TokenBucket,
            StrategyKind::SlidingWindow,
            StrategyKind::FixedWindow,
        ] {
            let config = RateLimitConfig::new("svc", kind, 100, Duration::from_secs(60));
            let strategy = build_strategy(&config, clock.clone());

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let strategy = Arc::clone(&strategy);
                    std::thread::spawn(move || {
                        (0..50)
                            .filter(|_| strategy.check_and_record("svc").can_make_request)
                            .count()
                    })
                })
                .collect();

            let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(admitted, 100, "{}", strategy.name());
            assert_eq!(strategy.status("svc").remaining_requests, 0);
        }
    }
}
