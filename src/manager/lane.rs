// src/manager/lane.rs

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::{ApiError, Result, WaitStage};
use crate::rate_limiter::RateLimiter;

/// Dispatch priority. Higher priorities leave the queue first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Snapshot of a service's connection pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolStats {
    pub active: usize,
    /// Pool capacity (`maxConcurrent`)
    pub total: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Queue position: highest priority first, then arrival order
type QueueKey = (Reverse<Priority>, u64);

#[derive(Debug)]
struct LaneState {
    max_concurrent: usize,
    max_queued: Option<usize>,
    active: usize,
    queue: BTreeSet<QueueKey>,
    next_seq: u64,
    completed: u64,
    failed: u64,
}

/// Outcome of one dispatch attempt
#[derive(Debug)]
pub(crate) enum Gate {
    /// Left the queue, holds a pool slot and has been counted by the rate limiter
    Dispatched(PoolSlot),
    /// At the head of the queue but the rate limiter said wait this long
    RateLimited(Duration),
    /// At the head of the queue with every pool slot taken
    PoolFull,
    /// Someone ahead in the queue goes first; carries what the head is waiting on
    Behind(WaitStage),
}

/// One service's admission queue and connection pool.
///
/// Everything that decides who goes next happens under `state`: the request
/// must be at the head of the queue, a pool slot must be free, and the rate
/// limiter must admit it. Whoever changes the picture (a slot freed, a request
/// dispatched or abandoned) wakes every waiter so the new head can try again.
#[derive(Debug)]
pub(crate) struct Lane {
    service_id: String,
    state: Mutex<LaneState>,
    changed: Notify,
}

impl Lane {
    pub(crate) fn new(service_id: &str, max_concurrent: usize, max_queued: Option<usize>) -> Self {
        Self {
            service_id: service_id.to_string(),
            state: Mutex::new(LaneState {
                max_concurrent: max_concurrent.max(1),
                max_queued,
                active: 0,
                queue: BTreeSet::new(),
                next_seq: 0,
                completed: 0,
                failed: 0,
            }),
            changed: Notify::new(),
        }
    }

    /// Applies new pool limits; in-flight requests keep their slots
    pub(crate) fn resize(&self, max_concurrent: usize, max_queued: Option<usize>) {
        {
            let mut state = self.state.lock();
            state.max_concurrent = max_concurrent.max(1);
            state.max_queued = max_queued;
        }
        self.changed.notify_waiters();
    }

    pub(crate) fn stats(&self) -> ConnectionPoolStats {
        let state = self.state.lock();
        ConnectionPoolStats {
            active: state.active,
            total: state.max_concurrent,
            queued: state.queue.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    /// A future that completes on the next change; call `enable` on it before checking state
    pub(crate) fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Joins the queue, or fails when the queue is already at `maxQueued`
    pub(crate) fn enqueue(self: &Arc<Self>, priority: Priority) -> Result<QueueTicket> {
        let mut state = self.state.lock();
        if let Some(max_queued) = state.max_queued {
            if state.queue.len() >= max_queued {
                return Err(ApiError::ConnectionPoolExhausted {
                    service_id: self.service_id.clone(),
                    max_concurrent: state.max_concurrent,
                    queued: state.queue.len(),
                });
            }
        }

        let key = (Reverse(priority), state.next_seq);
        state.next_seq += 1;
        state.queue.insert(key);

        Ok(QueueTicket {
            lane: Arc::clone(self),
            key,
            queued: true,
        })
    }

    /// Tries to move `ticket` from the queue into the pool
    pub(crate) fn try_dispatch(
        self: &Arc<Self>,
        ticket: &mut QueueTicket,
        limiter: &RateLimiter,
    ) -> Gate {
        let gate = {
            let mut state = self.state.lock();
            let pool_full = state.active >= state.max_concurrent;

            if state.queue.first() != Some(&ticket.key) {
                let stage = if pool_full {
                    WaitStage::ConnectionPool
                } else {
                    WaitStage::RateLimit
                };
                return Gate::Behind(stage);
            }
            if pool_full {
                return Gate::PoolFull;
            }

            let status = limiter.check_and_record(&self.service_id);
            if !status.can_make_request {
                return Gate::RateLimited(status.wait_time);
            }

            state.queue.remove(&ticket.key);
            state.active += 1;
            ticket.queued = false;
            Gate::Dispatched(PoolSlot {
                lane: Arc::clone(self),
                settled: false,
            })
        };

        // The head moved on; whoever is next gets its turn
        self.changed.notify_waiters();
        gate
    }

    fn leave_queue(&self, key: &QueueKey) {
        let was_head = {
            let mut state = self.state.lock();
            let was_head = state.queue.first() == Some(key);
            state.queue.remove(key);
            was_head
        };
        if was_head {
            self.changed.notify_waiters();
        }
    }

    fn release(&self, success: Option<bool>) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            match success {
                Some(true) => state.completed += 1,
                Some(false) => state.failed += 1,
                None => {}
            }
        }
        self.changed.notify_waiters();
    }
}

/// A place in the queue; dropping it while still queued gives the place up
#[derive(Debug)]
pub(crate) struct QueueTicket {
    lane: Arc<Lane>,
    key: QueueKey,
    queued: bool,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if self.queued {
            self.lane.leave_queue(&self.key);
        }
    }
}

/// A held connection-pool slot; released on `finish` or when dropped
#[derive(Debug)]
pub(crate) struct PoolSlot {
    lane: Arc<Lane>,
    settled: bool,
}

impl PoolSlot {
    pub(crate) fn finish(mut self, success: bool) {
        self.settled = true;
        self.lane.release(Some(success));
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        // Cancelled mid-flight: free the slot without counting an outcome
        if !self.settled {
            self.lane.release(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{RateLimitConfig, StrategyKind};
    use crate::events::EventBus;

    fn permissive() -> RateLimiter {
        RateLimiter::permissive(Arc::new(ManualClock::new(0)), EventBus::default())
    }

    #[test]
    fn test_priority_orders_queue() {
        let lane = Arc::new(Lane::new("svc", 1, None));
        let limiter = permissive();

        let mut low = lane.enqueue(Priority::Low).unwrap();
        let mut high = lane.enqueue(Priority::High).unwrap();

        assert!(matches!(lane.try_dispatch(&mut low, &limiter), Gate::Behind(_)));
        let slot = match lane.try_dispatch(&mut high, &limiter) {
            Gate::Dispatched(slot) => slot,
            other => panic!("expected dispatch, got {:?}", other),
        };

        assert!(matches!(lane.try_dispatch(&mut low, &limiter), Gate::PoolFull));
        slot.finish(true);
        assert!(matches!(lane.try_dispatch(&mut low, &limiter), Gate::Dispatched(_)));
    }

    #[test]
    fn test_same_priority_is_fifo() {
        let lane = Arc::new(Lane::new("svc", 4, None));
        let limiter = permissive();

        let mut first = lane.enqueue(Priority::Normal).unwrap();
        let mut second = lane.enqueue(Priority::Normal).unwrap();

        assert!(matches!(lane.try_dispatch(&mut second, &limiter), Gate::Behind(_)));
        assert!(matches!(lane.try_dispatch(&mut first, &limiter), Gate::Dispatched(_)));
        assert!(matches!(lane.try_dispatch(&mut second, &limiter), Gate::Dispatched(_)));
    }

    #[test]
    fn test_dropped_ticket_leaves_queue() {
        let lane = Arc::new(Lane::new("svc", 1, Some(1)));
        let ticket = lane.enqueue(Priority::Normal).unwrap();

        assert!(matches!(
            lane.enqueue(Priority::High),
            Err(ApiError::ConnectionPoolExhausted { queued: 1, .. })
        ));

        drop(ticket);
        assert_eq!(lane.stats().queued, 0);
        assert!(lane.enqueue(Priority::High).is_ok());
    }

    #[test]
    fn test_rate_limited_head_is_not_recorded_twice() {
        let lane = Arc::new(Lane::new("svc", 4, None));
        let limiter = permissive();
        limiter
            .configure(RateLimitConfig::new(
                "svc",
                StrategyKind::FixedWindow,
                1,
                Duration::from_secs(1),
            ))
            .unwrap();

        let mut first = lane.enqueue(Priority::Normal).unwrap();
        let mut second = lane.enqueue(Priority::Normal).unwrap();

        assert!(matches!(lane.try_dispatch(&mut first, &limiter), Gate::Dispatched(_)));
        assert!(matches!(lane.try_dispatch(&mut second, &limiter), Gate::RateLimited(_)));
        assert!(matches!(lane.try_dispatch(&mut second, &limiter), Gate::RateLimited(_)));
        assert_eq!(limiter.status("svc").remaining_requests, 0);
    }

    #[test]
    fn test_pool_stats_count_outcomes() {
        let lane = Arc::new(Lane::new("svc", 2, None));
        let limiter = permissive();

        let mut a = lane.enqueue(Priority::Normal).unwrap();
        let mut b = lane.enqueue(Priority::Normal).unwrap();
        let c = lane.enqueue(Priority::Normal).unwrap();

        let slot_a = match lane.try_dispatch(&mut a, &limiter) {
            Gate::Dispatched(slot) => slot,
            other => panic!("expected dispatch, got {:?}", other),
        };
        let slot_b = match lane.try_dispatch(&mut b, &limiter) {
            Gate::Dispatched(slot) => slot,
            other => panic!("expected dispatch, got {:?}", other),
        };

        let stats = lane.stats();
        assert_eq!((stats.active, stats.total, stats.queued), (2, 2, 1));

        slot_a.finish(true);
        slot_b.finish(false);
        drop(c);

        let stats = lane.stats();
        assert_eq!((stats.active, stats.queued), (0, 0));
        assert_eq!((stats.completed, stats.failed), (1, 1));
    }
}
