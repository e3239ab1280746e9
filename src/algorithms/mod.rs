// src/algorithms/mod.rs

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

#[cfg(test)]
mod tests;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::{RateLimitConfig, StrategyKind};

/// Snapshot of a service's rate limit state
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    /// Whether a request could be made right now
    pub can_make_request: bool,

    /// Requests that could still be made before the limit is hit
    pub remaining_requests: u64,

    /// Time until the limiter is back at full capacity
    pub reset_time: Duration,

    /// Time until the next request can be made; zero when `can_make_request`
    pub wait_time: Duration,

    pub strategy_name: &'static str,
}

/// Core contract every rate limiting algorithm implements.
///
/// Checks never fail: they only report. Callers decide what to do with a `false`.
pub trait RateLimitStrategy: Send + Sync + Debug {
    /// Algorithm name reported in statuses
    fn name(&self) -> &'static str;

    /// Checks if a request is allowed without recording it
    fn can_make_request(&self, service_id: &str) -> bool;

    /// Consumes one unit of capacity. Does nothing when none is left.
    fn record_request(&self, service_id: &str);

    /// Zero when a request could be made now, otherwise the minimum wait
    fn wait_time(&self, service_id: &str) -> Duration;

    fn status(&self, service_id: &str) -> RateLimitStatus;

    /// Checks and, if allowed, records the request under one lock.
    /// `can_make_request` tells whether this request was admitted; the other
    /// fields describe the state after recording.
    fn check_and_record(&self, service_id: &str) -> RateLimitStatus;

    /// Optional reset capability
    fn as_resettable(&self) -> Option<&dyn Resettable> {
        None
    }
}

/// Strategies that can forget a service's history
pub trait Resettable {
    /// Clears all state for the service, as if it had never been seen
    fn reset(&self, service_id: &str);
}

/// Builds the strategy named in `config`
pub fn build_strategy(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Arc<dyn RateLimitStrategy> {
    match config.strategy {
        StrategyKind::TokenBucket => Arc::new(TokenBucket::new(config, clock)),
        StrategyKind::SlidingWindow => Arc::new(SlidingWindow::new(config, clock)),
        StrategyKind::FixedWindow => Arc::new(FixedWindow::new(config, clock)),
    }
}

/// Per-service state records, each behind its own lock.
///
/// The map shard is only held long enough to clone the entry's `Arc`, so two
/// services never contend on each other's state.
#[derive(Debug)]
pub(crate) struct ServiceStates<S> {
    states: DashMap<String, Arc<Mutex<S>>>,
}

impl<S> ServiceStates<S> {
    pub(crate) fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Runs `f` with exclusive access to the service's state, creating it with `init` on first use
    pub(crate) fn with_state<R>(
        &self,
        service_id: &str,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let existing = self
            .states
            .get(service_id)
            .map(|entry| Arc::clone(entry.value()));
        let entry = match existing {
            Some(existing) => existing,
            None => Arc::clone(
                self.states
                    .entry(service_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(init())))
                    .value(),
            ),
        };

        let mut state = entry.lock();
        f(&mut state)
    }

    pub(crate) fn remove(&self, service_id: &str) {
        self.states.remove(service_id);
    }
}

/// Rounds a fractional millisecond wait up to a whole millisecond
pub(crate) fn ceil_millis(millis: f64) -> Duration {
    if millis <= 0.0 || !millis.is_finite() {
        Duration::ZERO
    } else {
        Duration::from_millis(millis.ceil() as u64)
    }
}
