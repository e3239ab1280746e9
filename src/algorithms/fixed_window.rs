// src/algorithms/fixed_window.rs

use std::sync::Arc;
use std::time::Duration;

use crate::algorithms::{RateLimitStatus, RateLimitStrategy, Resettable, ServiceStates};
use crate::clock::Clock;
use crate::config::RateLimitConfig;

/// Fixed Window rate limiting algorithm
///
/// The fixed window algorithm divides time into aligned windows (multiples of
/// the window length on the clock's timeline) and limits the number of
/// requests in each window. When a new window starts, the counter resets.
///
/// Traffic that straddles a boundary can see up to twice the limit inside one
/// window-length span. That is inherent to the algorithm.
#[derive(Debug)]
pub struct FixedWindow {
    limit: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    counters: ServiceStates<WindowCounter>,
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start: u64,
    count: u64,
}

impl FixedWindow {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: config.limit,
            window_ms: config.window_millis().max(1),
            clock,
            counters: ServiceStates::new(),
        }
    }

    /// Start of the aligned window containing `now`
    fn current_window(&self, now: u64) -> u64 {
        now - (now % self.window_ms)
    }

    fn with_counter<R>(&self, service_id: &str, f: impl FnOnce(&mut WindowCounter, u64) -> R) -> R {
        let now = self.clock.now_millis();
        let window_start = self.current_window(now);

        self.counters.with_state(
            service_id,
            || WindowCounter {
                window_start,
                count: 0,
            },
            |counter| {
                // Snap to the current window, however many windows went by idle
                if now.saturating_sub(counter.window_start) >= self.window_ms {
                    counter.window_start = window_start;
                    counter.count = 0;
                }
                f(counter, now)
            },
        )
    }

    fn until_next_window(&self, counter: &WindowCounter, now: u64) -> Duration {
        Duration::from_millis((counter.window_start + self.window_ms).saturating_sub(now))
    }

    fn snapshot(&self, counter: &WindowCounter, now: u64) -> RateLimitStatus {
        let can_make_request = counter.count < self.limit;
        let reset_time = self.until_next_window(counter, now);

        RateLimitStatus {
            can_make_request,
            remaining_requests: self.limit.saturating_sub(counter.count),
            reset_time,
            wait_time: if can_make_request {
                Duration::ZERO
            } else {
                reset_time
            },
            strategy_name: self.name(),
        }
    }
}

impl RateLimitStrategy for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed-window"
    }

    fn can_make_request(&self, service_id: &str) -> bool {
        self.with_counter(service_id, |counter, _| counter.count < self.limit)
    }

    fn record_request(&self, service_id: &str) {
        self.with_counter(service_id, |counter, _| {
            if counter.count < self.limit {
                counter.count += 1;
            }
        })
    }

    fn wait_time(&self, service_id: &str) -> Duration {
        self.with_counter(service_id, |counter, now| {
            if counter.count < self.limit {
                Duration::ZERO
            } else {
                self.until_next_window(counter, now)
            }
        })
    }

    fn status(&self, service_id: &str) -> RateLimitStatus {
        self.with_counter(service_id, |counter, now| self.snapshot(counter, now))
    }

    fn check_and_record(&self, service_id: &str) -> RateLimitStatus {
        self.with_counter(service_id, |counter, now| {
            let allowed = counter.count < self.limit;
            if allowed {
                counter.count += 1;
            }
            RateLimitStatus {
                can_make_request: allowed,
                ..self.snapshot(counter, now)
            }
        })
    }

    fn as_resettable(&self) -> Option<&dyn Resettable> {
        Some(self)
    }
}

impl Resettable for FixedWindow {
    fn reset(&self, service_id: &str) {
        self.counters.remove(service_id);
    }
}
