// src/rate_limiter.rs

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::algorithms::{build_strategy, RateLimitStatus, RateLimitStrategy};
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::events::{timestamp, EventBus, ResilienceEvent};
use crate::rate_limit_event;

/// What to do with services that were never configured
#[derive(Debug, Clone)]
pub enum DefaultPolicy {
    /// Always allow
    Permissive,
    /// Lazily bind a strategy built from this template (its service id is replaced)
    Limited(RateLimitConfig),
}

/// A strategy bound to one service, or a disabled entry that always allows
#[derive(Debug, Clone)]
enum Binding {
    Active(Arc<dyn RateLimitStrategy>),
    Disabled,
}

/// Central per-service directory of rate limiting strategies.
///
/// The limiter never rejects anything itself: it answers questions, and
/// callers that decide to hold back report it through [`RateLimiter::notify_exceeded`].
#[derive(Debug)]
pub struct RateLimiter {
    bindings: DashMap<String, Binding>,
    configured: DashMap<String, RateLimitConfig>,
    default_policy: DefaultPolicy,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), EventBus::default())
    }
}

impl RateLimiter {
    /// Limiter whose unconfigured services get 10 requests per second, sliding window
    pub fn new(clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self::with_default_policy(
            DefaultPolicy::Limited(RateLimitConfig::default_for("*")),
            clock,
            events,
        )
    }

    /// Limiter whose unconfigured services are never limited
    pub fn permissive(clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self::with_default_policy(DefaultPolicy::Permissive, clock, events)
    }

    pub fn with_default_policy(
        default_policy: DefaultPolicy,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            bindings: DashMap::new(),
            configured: DashMap::new(),
            default_policy,
            clock,
            events,
        }
    }

    /// Binds a freshly built strategy to `config.service_id`.
    ///
    /// Any previous strategy for the service, and everything it accumulated, is discarded.
    pub fn configure(&self, config: RateLimitConfig) -> Result<()> {
        config.validate()?;

        let binding = if config.enabled {
            Binding::Active(build_strategy(&config, Arc::clone(&self.clock)))
        } else {
            Binding::Disabled
        };

        info!(
            service_id = %config.service_id,
            strategy = %config.strategy,
            limit = config.limit,
            window_ms = config.window_millis(),
            enabled = config.enabled,
            "Rate limit configured"
        );

        self.bindings.insert(config.service_id.clone(), binding);
        self.configured.insert(config.service_id.clone(), config);
        Ok(())
    }

    /// Forgets the service entirely; it falls back to the default policy
    pub fn remove(&self, service_id: &str) {
        self.bindings.remove(service_id);
        self.configured.remove(service_id);
    }

    pub fn config(&self, service_id: &str) -> Option<RateLimitConfig> {
        self.configured.get(service_id).map(|c| c.value().clone())
    }

    pub fn configured_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.configured.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    fn binding(&self, service_id: &str) -> Binding {
        if let Some(binding) = self.bindings.get(service_id) {
            return binding.value().clone();
        }

        match &self.default_policy {
            DefaultPolicy::Permissive => Binding::Disabled,
            DefaultPolicy::Limited(template) => {
                let mut config = template.clone();
                config.service_id = service_id.to_string();
                debug!(service_id, strategy = %config.strategy, "Applying default rate limit");

                let clock = Arc::clone(&self.clock);
                self.bindings
                    .entry(service_id.to_string())
                    .or_insert_with(|| Binding::Active(build_strategy(&config, clock)))
                    .value()
                    .clone()
            }
        }
    }

    pub fn can_make_request(&self, service_id: &str) -> bool {
        match self.binding(service_id) {
            Binding::Active(strategy) => strategy.can_make_request(service_id),
            Binding::Disabled => true,
        }
    }

    pub fn record_request(&self, service_id: &str) {
        if let Binding::Active(strategy) = self.binding(service_id) {
            strategy.record_request(service_id);
        }
    }

    pub fn wait_time(&self, service_id: &str) -> Duration {
        match self.binding(service_id) {
            Binding::Active(strategy) => strategy.wait_time(service_id),
            Binding::Disabled => Duration::ZERO,
        }
    }

    pub fn status(&self, service_id: &str) -> RateLimitStatus {
        match self.binding(service_id) {
            Binding::Active(strategy) => strategy.status(service_id),
            Binding::Disabled => unlimited_status(),
        }
    }

    /// Checks and records in one step
    pub fn check_and_record(&self, service_id: &str) -> RateLimitStatus {
        let status = match self.binding(service_id) {
            Binding::Active(strategy) => strategy.check_and_record(service_id),
            Binding::Disabled => unlimited_status(),
        };

        rate_limit_event!(
            service_id,
            status.can_make_request,
            status.remaining_requests,
            status.wait_time.as_millis() as u64,
            status.strategy_name
        );
        status
    }

    /// Clears the service's history. Returns false if its strategy cannot reset.
    pub fn reset(&self, service_id: &str) -> bool {
        match self.binding(service_id) {
            Binding::Active(strategy) => match strategy.as_resettable() {
                Some(resettable) => {
                    resettable.reset(service_id);
                    true
                }
                None => false,
            },
            Binding::Disabled => true,
        }
    }

    /// Publishes `rate-limit-exceeded` for a caller that wanted to proceed but was told to wait
    pub fn notify_exceeded(&self, service_id: &str) -> Duration {
        let wait_time = self.wait_time(service_id);
        self.events.publish(ResilienceEvent::RateLimitExceeded {
            service_id: service_id.to_string(),
            wait_time_ms: wait_time.as_millis() as u64,
            timestamp: timestamp(self.clock.now_millis()),
        });
        wait_time
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

fn unlimited_status() -> RateLimitStatus {
    RateLimitStatus {
        can_make_request: true,
        remaining_requests: u64::MAX,
        reset_time: Duration::ZERO,
        wait_time: Duration::ZERO,
        strategy_name: "disabled",
    }
}
