use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::algorithms::ServiceStates;
use crate::circuit_transition;
use crate::clock::{Clock, SystemClock};
use crate::config::CircuitBreakerConfig;
use crate::error::{ApiError, Result};
use crate::events::{timestamp, CircuitStats, EventBus, ResilienceEvent};

/// The state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are failing and not being sent
    Open,
    /// Circuit is partially open, allowing a limited number of requests to test recovery
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition; outcomes from an older generation are ignored
    generation: u64,
    /// Timestamps of failures still inside the monitoring window
    failures: VecDeque<u64>,
    successes: u32,
    trials_in_flight: u32,
    opened_at: Option<u64>,
    total_failures: u64,
    total_successes: u64,
    rejected: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            failures: VecDeque::new(),
            successes: 0,
            trials_in_flight: 0,
            opened_at: None,
            total_failures: 0,
            total_successes: 0,
            rejected: 0,
            times_opened: 0,
        }
    }

    fn stats(&self) -> CircuitStats {
        CircuitStats {
            failures: self.failures.len() as u32,
            successes: self.successes,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            rejected: self.rejected,
            times_opened: self.times_opened,
        }
    }

    /// Time left before an open breaker admits a trial; None once it may
    fn open_remaining(&self, now: u64, recovery_ms: u64) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = now.saturating_sub(self.opened_at.unwrap_or(now));
        (elapsed < recovery_ms).then(|| Duration::from_millis(recovery_ms - elapsed))
    }

    fn transition(&mut self, to: CircuitState, now: u64) {
        self.state = to;
        self.generation += 1;
        self.successes = 0;
        self.trials_in_flight = 0;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.times_opened += 1;
            }
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                self.opened_at = None;
                self.failures.clear();
            }
        }
    }
}

/// Permission to run one operation, tied to the generation it was granted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    generation: u64,
    trial: bool,
}

/// Releases a half-open trial slot if the operation never reported back
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    service_id: &'a str,
    ticket: Ticket,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.ticket.trial && !self.settled {
            self.breaker.release_trial(self.service_id, self.ticket);
        }
    }
}

/// Per-service circuit breakers.
///
/// Each service has its own state machine behind its own lock. The decision to
/// let a call through and any transition it causes happen under that lock, so
/// once a breaker has opened no concurrent caller can slip past it.
#[derive(Debug)]
pub struct CircuitBreaker {
    configs: DashMap<String, CircuitBreakerConfig>,
    breakers: ServiceStates<BreakerState>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), EventBus::default())
    }
}

impl CircuitBreaker {
    pub fn new(clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            configs: DashMap::new(),
            breakers: ServiceStates::new(),
            clock,
            events,
        }
    }

    /// Registers a configuration. Existing state for the service is kept.
    pub fn configure(&self, config: CircuitBreakerConfig) -> Result<()> {
        config.validate()?;
        debug!(
            service_id = %config.service_id,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            "Circuit breaker configured"
        );
        self.configs.insert(config.service_id.clone(), config);
        Ok(())
    }

    /// Configuration in effect for a service; unconfigured services use the defaults
    pub fn config(&self, service_id: &str) -> CircuitBreakerConfig {
        self.configs
            .get(service_id)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| CircuitBreakerConfig::new(service_id))
    }

    /// Runs `operation` if the breaker for the service lets it through
    pub async fn execute<T, F, Fut>(&self, service_id: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = self.config(service_id);
        if !config.enabled {
            return operation().await;
        }

        let ticket = self.acquire(service_id, &config)?;
        let mut guard = TrialGuard {
            breaker: self,
            service_id,
            ticket,
            settled: false,
        };

        let result = operation().await;
        guard.settled = true;
        self.record(service_id, &config, ticket, result.is_ok());
        result
    }

    /// Like [`CircuitBreaker::execute`], but rejections and failures are handed to `fallback`.
    ///
    /// Whatever the fallback returns, including its own errors, is returned as is.
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(
        &self,
        service_id: &str,
        operation: F,
        fallback: FB,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(ApiError) -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        match self.execute(service_id, operation).await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(service_id, error = %err, "Invoking fallback");
                fallback(err).await
            }
        }
    }

    /// Current state. An open breaker whose recovery timeout has passed reads
    /// as half-open; the transition itself happens on the next `execute`.
    pub fn state(&self, service_id: &str) -> CircuitState {
        let recovery_ms = self.config(service_id).recovery_timeout.as_millis() as u64;
        let now = self.clock.now_millis();
        self.breakers.with_state(service_id, BreakerState::new, |breaker| {
            if breaker.state == CircuitState::Open && breaker.open_remaining(now, recovery_ms).is_none() {
                CircuitState::HalfOpen
            } else {
                breaker.state
            }
        })
    }

    pub fn stats(&self, service_id: &str) -> CircuitStats {
        let window = self.config(service_id).monitoring_window.as_millis() as u64;
        let now = self.clock.now_millis();
        self.breakers.with_state(service_id, BreakerState::new, |breaker| {
            prune_failures(&mut breaker.failures, now, window);
            breaker.stats()
        })
    }

    /// Forces the breaker closed and clears its counters
    pub fn reset(&self, service_id: &str) {
        let now = self.clock.now_millis();
        let event = self.breakers.with_state(service_id, BreakerState::new, |breaker| {
            let was = breaker.state;
            breaker.transition(CircuitState::Closed, now);
            (was != CircuitState::Closed).then(|| ResilienceEvent::CircuitClosed {
                service_id: service_id.to_string(),
                stats: breaker.stats(),
                timestamp: timestamp(now),
            })
        });
        if let Some(event) = event {
            self.events.publish(event);
        }
    }

    /// Forces the breaker open, as if the failure threshold had just been reached
    pub fn force_open(&self, service_id: &str) {
        let now = self.clock.now_millis();
        let event = self.breakers.with_state(service_id, BreakerState::new, |breaker| {
            breaker.transition(CircuitState::Open, now);
            ResilienceEvent::CircuitOpened {
                service_id: service_id.to_string(),
                stats: breaker.stats(),
                timestamp: timestamp(now),
            }
        });
        self.events.publish(event);
    }

    fn acquire(&self, service_id: &str, config: &CircuitBreakerConfig) -> Result<Ticket> {
        let now = self.clock.now_millis();
        let recovery_ms = config.recovery_timeout.as_millis() as u64;
        let trial_limit = config.half_open_limit();

        type Decision = (std::result::Result<Ticket, Duration>, Option<ResilienceEvent>);

        let (decision, event) = self.breakers.with_state(service_id, BreakerState::new, |breaker| -> Decision {
            let mut event = None;

            if breaker.state == CircuitState::Open {
                if let Some(retry_after) = breaker.open_remaining(now, recovery_ms) {
                    breaker.rejected += 1;
                    return (Err(retry_after), None);
                }

                circuit_transition!(
                    service_id,
                    CircuitState::Open,
                    CircuitState::HalfOpen,
                    breaker.failures.len()
                );
                breaker.transition(CircuitState::HalfOpen, now);
                event = Some(ResilienceEvent::CircuitHalfOpened {
                    service_id: service_id.to_string(),
                    timestamp: timestamp(now),
                });
            }

            match breaker.state {
                CircuitState::Closed => (
                    Ok(Ticket {
                        generation: breaker.generation,
                        trial: false,
                    }),
                    event,
                ),
                CircuitState::HalfOpen if breaker.trials_in_flight < trial_limit => {
                    breaker.trials_in_flight += 1;
                    (
                        Ok(Ticket {
                            generation: breaker.generation,
                            trial: true,
                        }),
                        event,
                    )
                }
                _ => {
                    breaker.rejected += 1;
                    (Err(Duration::ZERO), event)
                }
            }
        });

        if let Some(event) = event {
            self.events.publish(event);
        }

        decision.map_err(|retry_after| {
            debug!(service_id, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, call rejected");
            ApiError::CircuitOpen {
                service_id: service_id.to_string(),
                retry_after,
            }
        })
    }

    fn record(&self, service_id: &str, config: &CircuitBreakerConfig, ticket: Ticket, success: bool) {
        let now = self.clock.now_millis();
        let window_ms = config.monitoring_window.as_millis() as u64;

        let event = self.breakers.with_state(service_id, BreakerState::new, |breaker| {
            if success {
                breaker.total_successes += 1;
            } else {
                breaker.total_failures += 1;
            }

            if ticket.generation != breaker.generation {
                // Admitted before the last transition; says nothing about the current state
                return None;
            }

            match (breaker.state, success) {
                (CircuitState::Closed, true) => None,
                (CircuitState::Closed, false) => {
                    breaker.failures.push_back(now);
                    prune_failures(&mut breaker.failures, now, window_ms);
                    if breaker.failures.len() as u32 >= config.failure_threshold {
                        circuit_transition!(
                            service_id,
                            CircuitState::Closed,
                            CircuitState::Open,
                            breaker.failures.len()
                        );
                        let stats = breaker.stats();
                        breaker.transition(CircuitState::Open, now);
                        Some(ResilienceEvent::CircuitOpened {
                            service_id: service_id.to_string(),
                            stats: CircuitStats {
                                times_opened: breaker.times_opened,
                                ..stats
                            },
                            timestamp: timestamp(now),
                        })
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, true) => {
                    breaker.trials_in_flight = breaker.trials_in_flight.saturating_sub(1);
                    breaker.successes += 1;
                    if breaker.successes >= config.success_threshold {
                        circuit_transition!(
                            service_id,
                            CircuitState::HalfOpen,
                            CircuitState::Closed,
                            breaker.failures.len()
                        );
                        let stats = breaker.stats();
                        breaker.transition(CircuitState::Closed, now);
                        Some(ResilienceEvent::CircuitClosed {
                            service_id: service_id.to_string(),
                            stats,
                            timestamp: timestamp(now),
                        })
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, false) => {
                    circuit_transition!(
                        service_id,
                        CircuitState::HalfOpen,
                        CircuitState::Open,
                        breaker.failures.len()
                    );
                    breaker.transition(CircuitState::Open, now);
                    Some(ResilienceEvent::CircuitOpened {
                        service_id: service_id.to_string(),
                        stats: breaker.stats(),
                        timestamp: timestamp(now),
                    })
                }
                (CircuitState::Open, _) => None,
            }
        });

        if let Some(event) = event {
            self.events.publish(event);
        }
    }

    fn release_trial(&self, service_id: &str, ticket: Ticket) {
        self.breakers.with_state(service_id, BreakerState::new, |breaker| {
            if breaker.generation == ticket.generation && breaker.state == CircuitState::HalfOpen {
                breaker.trials_in_flight = breaker.trials_in_flight.saturating_sub(1);
            }
        });
    }
}

fn prune_failures(failures: &mut VecDeque<u64>, now: u64, window_ms: u64) {
    while let Some(oldest) = failures.front() {
        if now.saturating_sub(*oldest) >= window_ms {
            failures.pop_front();
        } else {
            break;
        }
    }
}
