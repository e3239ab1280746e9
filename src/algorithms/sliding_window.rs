// src/algorithms/sliding_window.rs

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::algorithms::{RateLimitStatus, RateLimitStrategy, Resettable, ServiceStates};
use crate::clock::Clock;
use crate::config::RateLimitConfig;

/// Sliding Window rate limiting algorithm
///
/// Keeps the exact timestamp of every accepted request in the trailing
/// window. A request is allowed while fewer than `limit` timestamps are
/// younger than the window. Memory grows with traffic, up to `limit` entries
/// per service.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    windows: ServiceStates<VecDeque<RequestRecord>>,
}

/// One accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub timestamp: u64,
    pub count: u64,
}

impl SlidingWindow {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: config.limit,
            window_ms: config.window_millis().max(1),
            clock,
            windows: ServiceStates::new(),
        }
    }

    /// Number of requests currently inside the window
    pub fn active_requests(&self, service_id: &str) -> u64 {
        self.with_window(service_id, |records, _| Self::count(records))
    }

    fn with_window<R>(
        &self,
        service_id: &str,
        f: impl FnOnce(&mut VecDeque<RequestRecord>, u64) -> R,
    ) -> R {
        let now = self.clock.now_millis();
        let window_ms = self.window_ms;

        self.windows.with_state(service_id, VecDeque::new, |records| {
            // Drop everything that has aged out of (now - window, now]
            while let Some(oldest) = records.front() {
                if now.saturating_sub(oldest.timestamp) >= window_ms {
                    records.pop_front();
                } else {
                    break;
                }
            }
            f(records, now)
        })
    }

    fn count(records: &VecDeque<RequestRecord>) -> u64 {
        records.iter().map(|record| record.count).sum()
    }

    fn push(records: &mut VecDeque<RequestRecord>, now: u64) {
        match records.back_mut() {
            Some(last) if last.timestamp == now => last.count += 1,
            _ => records.push_back(RequestRecord {
                timestamp: now,
                count: 1,
            }),
        }
    }

    /// Time until enough of the oldest requests age out to leave room for one more
    fn wait_for(&self, records: &VecDeque<RequestRecord>, now: u64) -> Duration {
        let mut excess = Self::count(records) + 1;
        if excess <= self.limit {
            return Duration::ZERO;
        }
        excess -= self.limit;

        for record in records {
            if record.count >= excess {
                let expires_at = record.timestamp + self.window_ms;
                return Duration::from_millis(expires_at.saturating_sub(now));
            }
            excess -= record.count;
        }
        Duration::ZERO
    }

    fn snapshot(&self, records: &VecDeque<RequestRecord>, now: u64) -> RateLimitStatus {
        let active = Self::count(records);
        let reset_time = records
            .back()
            .map(|newest| Duration::from_millis((newest.timestamp + self.window_ms).saturating_sub(now)))
            .unwrap_or(Duration::ZERO);

        RateLimitStatus {
            can_make_request: active < self.limit,
            remaining_requests: self.limit.saturating_sub(active),
            reset_time,
            wait_time: self.wait_for(records, now),
            strategy_name: self.name(),
        }
    }
}

impl RateLimitStrategy for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding-window"
    }

    fn can_make_request(&self, service_id: &str) -> bool {
        self.with_window(service_id, |records, _| Self::count(records) < self.limit)
    }

    fn record_request(&self, service_id: &str) {
        self.with_window(service_id, |records, now| {
            if Self::count(records) < self.limit {
                Self::push(records, now);
            }
        })
    }

    fn wait_time(&self, service_id: &str) -> Duration {
        self.with_window(service_id, |records, now| self.wait_for(records, now))
    }

    fn status(&self, service_id: &str) -> RateLimitStatus {
        self.with_window(service_id, |records, now| self.snapshot(records, now))
    }

    fn check_and_record(&self, service_id: &str) -> RateLimitStatus {
        self.with_window(service_id, |records, now| {
            let allowed = Self::count(records) < self.limit;
            if allowed {
                Self::push(records, now);
            }
            RateLimitStatus {
                can_make_request: allowed,
                ..self.snapshot(records, now)
            }
        })
    }

    fn as_resettable(&self) -> Option<&dyn Resettable> {
        Some(self)
    }
}

impl Resettable for SlidingWindow {
    fn reset(&self, service_id: &str) {
        self.windows.remove(service_id);
    }
}
