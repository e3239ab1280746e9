// src/manager/mod.rs
//! Request pipeline that puts rate limiting, queueing, connection pooling and
//! circuit breaking in front of every call to a downstream service.
//!
//! A request moves through these stages:
//!
//! 1. It joins its service's wait queue, ordered by priority then arrival
//! 2. At the head of the queue it waits for a free pool slot and for the rate
//!    limiter to admit it; both are taken in one step
//! 3. The call runs inside the service's circuit breaker, bounded by what is
//!    left of the request timeout
//! 4. The slot is released and `request-completed` or `request-failed` is published

mod lane;
mod transport;

#[cfg(test)]
mod tests;

use dashmap::DashMap;
use reqwest::Method;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{
    duration_ms, CircuitBreakerConfig, RateLimitConfig, ResilienceSettings, ServiceConfig,
};
use crate::error::{ApiError, Result, WaitStage};
use crate::events::{EventBus, ResilienceEvent};
use crate::rate_limiter::{DefaultPolicy, RateLimiter};
use crate::resilience::{CircuitBreaker, CircuitState};

use lane::{Gate, Lane, PoolSlot};

pub use lane::{ConnectionPoolStats, Priority};
pub use transport::{ApiResponse, HttpRequest, HttpTransport, Transport};

/// One call through [`ApiManager::request`]
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub service_id: String,
    pub method: Method,
    /// Path relative to the service's base URL, or an absolute URL
    pub url: String,
    pub priority: Priority,
    /// Overrides the service's default timeout
    pub timeout: Option<Duration>,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl RequestOptions {
    pub fn new(service_id: &str, method: Method, url: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            method,
            url: url.to_string(),
            priority: Priority::Normal,
            timeout: None,
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn get(service_id: &str, url: &str) -> Self {
        Self::new(service_id, Method::GET, url)
    }

    pub fn post(service_id: &str, url: &str, body: serde_json::Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(service_id, Method::POST, url)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub service_id: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "latencyMs", with = "duration_ms")]
    pub latency: Duration,
    pub pool: ConnectionPoolStats,
    pub circuit_state: CircuitState,
}

/// Entry point for calls to downstream services
#[derive(Debug)]
pub struct ApiManager {
    services: DashMap<String, ServiceConfig>,
    lanes: DashMap<String, Arc<Lane>>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    transport: Arc<dyn Transport>,
    events: EventBus,
}

impl Default for ApiManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiManager {
    /// Manager on the system clock that sends requests with [`HttpTransport`]
    pub fn new() -> Self {
        Self::with_transport(Arc::new(HttpTransport::default()), Arc::new(SystemClock))
    }

    pub fn with_transport(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::default();
        let limiter = RateLimiter::new(Arc::clone(&clock), events.clone());
        Self::from_parts(limiter, transport, clock, events)
    }

    fn from_parts(
        limiter: RateLimiter,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            services: DashMap::new(),
            lanes: DashMap::new(),
            limiter,
            breaker: CircuitBreaker::new(clock, events.clone()),
            transport,
            events,
        }
    }

    /// Builds a manager and applies every section of a settings document
    pub fn from_settings(
        settings: &ResilienceSettings,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;

        let events = EventBus::default();
        let limiter = match &settings.default_rate_limit {
            Some(template) => RateLimiter::with_default_policy(
                DefaultPolicy::Limited(template.clone()),
                Arc::clone(&clock),
                events.clone(),
            ),
            None => RateLimiter::new(Arc::clone(&clock), events.clone()),
        };
        let manager = Self::from_parts(limiter, transport, clock, events);

        for service in &settings.services {
            manager.configure_service(service.clone())?;
        }
        for rate_limit in &settings.rate_limits {
            manager.configure_rate_limit(rate_limit.clone())?;
        }
        for breaker in &settings.circuit_breakers {
            manager.configure_circuit_breaker(breaker.clone())?;
        }

        Ok(manager)
    }

    /// Registers pool limits and request defaults for a service
    pub fn configure_service(&self, config: ServiceConfig) -> Result<()> {
        config.validate()?;
        info!(
            service_id = %config.service_id,
            base_url = %config.base_url,
            max_concurrent = config.max_concurrent,
            timeout_ms = config.timeout.as_millis() as u64,
            "Service configured"
        );

        if let Some(lane) = self.lanes.get(&config.service_id) {
            lane.resize(config.max_concurrent, config.max_queued);
        }
        self.services.insert(config.service_id.clone(), config);
        Ok(())
    }

    pub fn configure_rate_limit(&self, config: RateLimitConfig) -> Result<()> {
        self.limiter.configure(config)
    }

    pub fn configure_circuit_breaker(&self, config: CircuitBreakerConfig) -> Result<()> {
        self.breaker.configure(config)
    }

    pub fn service_config(&self, service_id: &str) -> Option<ServiceConfig> {
        self.services.get(service_id).map(|s| s.value().clone())
    }

    pub fn configured_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.events.subscribe()
    }

    pub fn pool_stats(&self, service_id: &str) -> ConnectionPoolStats {
        self.lane(service_id).stats()
    }

    /// Sends an HTTP request through the full pipeline
    pub async fn request(&self, options: RequestOptions) -> Result<ApiResponse> {
        let RequestOptions {
            service_id,
            method,
            url,
            priority,
            timeout,
            headers,
            body,
        } = options;

        let (url, mut merged_headers) = match self.service_config(&service_id) {
            Some(config) => (config.resolve_url(&url), config.headers),
            None if url.starts_with("http://") || url.starts_with("https://") => {
                (url, HashMap::new())
            }
            None => return Err(ApiError::UnknownService(service_id)),
        };
        merged_headers.extend(headers);

        let request_id = Uuid::new_v4();
        let transport = Arc::clone(&self.transport);
        let target = service_id.clone();

        self.dispatch(&service_id, request_id, priority, timeout, move |remaining| async move {
            transport
                .send(HttpRequest {
                    request_id,
                    service_id: target,
                    method,
                    url,
                    headers: merged_headers,
                    body,
                    timeout: remaining,
                })
                .await
        })
        .await
    }

    /// Runs an arbitrary operation through the same pipeline as [`ApiManager::request`]
    pub async fn execute<T, F, Fut>(
        &self,
        service_id: &str,
        priority: Priority,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.dispatch(service_id, Uuid::new_v4(), priority, timeout, |_| operation())
            .await
    }

    /// Probes `baseUrl + healthPath` at low priority
    pub async fn health_check(&self, service_id: &str) -> HealthCheckResult {
        self.probe(service_id, None).await
    }

    pub(crate) async fn probe(&self, service_id: &str, timeout: Option<Duration>) -> HealthCheckResult {
        let started = Instant::now();

        let outcome = match self.service_config(service_id) {
            Some(config) => {
                let mut options =
                    RequestOptions::get(service_id, &config.health_path).with_priority(Priority::Low);
                options.timeout = timeout;
                self.request(options).await.map(|_| ())
            }
            None => Err(ApiError::UnknownService(service_id.to_string())),
        };

        HealthCheckResult {
            service_id: service_id.to_string(),
            healthy: outcome.is_ok(),
            error: outcome.err().map(|err| err.to_string()),
            latency: started.elapsed(),
            pool: self.pool_stats(service_id),
            circuit_state: self.breaker.state(service_id),
        }
    }

    fn lane(&self, service_id: &str) -> Arc<Lane> {
        if let Some(lane) = self.lanes.get(service_id) {
            return Arc::clone(lane.value());
        }

        let (max_concurrent, max_queued) = match self.service_config(service_id) {
            Some(config) => (config.max_concurrent, config.max_queued),
            None => {
                let defaults = ServiceConfig::new(service_id, "");
                (defaults.max_concurrent, defaults.max_queued)
            }
        };

        Arc::clone(
            self.lanes
                .entry(service_id.to_string())
                .or_insert_with(|| Arc::new(Lane::new(service_id, max_concurrent, max_queued)))
                .value(),
        )
    }

    async fn dispatch<T, F, Fut>(
        &self,
        service_id: &str,
        request_id: Uuid,
        priority: Priority,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (default_timeout, queue_when_limited) = match self.service_config(service_id) {
            Some(config) => (config.timeout, config.queue_when_limited),
            None => {
                let defaults = ServiceConfig::new(service_id, "");
                (defaults.timeout, defaults.queue_when_limited)
            }
        };
        let timeout = timeout.unwrap_or(default_timeout);
        let started = Instant::now();
        let deadline = started + timeout;

        let admitted = self
            .admit(service_id, priority, queue_when_limited, timeout, deadline)
            .await;
        let slot = match admitted {
            Ok(slot) => slot,
            Err(err) => {
                self.publish_outcome(service_id, request_id, started, Err(&err));
                return Err(err);
            }
        };

        debug!(service_id, %request_id, ?priority, "Request dispatched");

        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = self
            .breaker
            .execute(service_id, || async move {
                match time::timeout(remaining, operation(remaining)).await {
                    Ok(result) => result,
                    Err(_) => Err(ApiError::RequestTimeout {
                        service_id: service_id.to_string(),
                        stage: WaitStage::Execution,
                        timeout,
                        retry_after: None,
                    }),
                }
            })
            .await;

        slot.finish(result.is_ok());
        self.publish_outcome(service_id, request_id, started, result.as_ref().map(|_| ()));
        result
    }

    /// Waits in the queue until the request holds a pool slot and a rate-limit unit
    async fn admit(
        &self,
        service_id: &str,
        priority: Priority,
        queue_when_limited: bool,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<PoolSlot> {
        let lane = self.lane(service_id);
        let mut ticket = lane.enqueue(priority)?;
        let mut announced = false;
        let mut blocked_on = None;

        loop {
            // An expired ticket never takes a slot, even one freed at the deadline
            if let Some(stage) = blocked_on {
                if Instant::now() >= deadline {
                    return Err(self.queue_timeout(service_id, stage, timeout));
                }
            }

            let changed = lane.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let (stage, wake_at) = match lane.try_dispatch(&mut ticket, &self.limiter) {
                Gate::Dispatched(slot) => return Ok(slot),
                Gate::RateLimited(wait) => {
                    if !announced {
                        self.limiter.notify_exceeded(service_id);
                        announced = true;
                    }
                    if !queue_when_limited {
                        return Err(ApiError::RateLimitExceeded {
                            service_id: service_id.to_string(),
                            wait_time: wait,
                        });
                    }
                    let wait = wait.max(Duration::from_millis(1));
                    (WaitStage::RateLimit, Some(Instant::now() + wait))
                }
                Gate::PoolFull => (WaitStage::ConnectionPool, None),
                Gate::Behind(stage) => (stage, None),
            };

            if Instant::now() >= deadline {
                return Err(self.queue_timeout(service_id, stage, timeout));
            }
            blocked_on = Some(stage);

            let wake_at = wake_at.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut changed => {}
                _ = time::sleep_until(wake_at) => {}
            }
        }
    }

    fn queue_timeout(&self, service_id: &str, stage: WaitStage, timeout: Duration) -> ApiError {
        let retry_after =
            (stage == WaitStage::RateLimit).then(|| self.limiter.wait_time(service_id));
        ApiError::RequestTimeout {
            service_id: service_id.to_string(),
            stage,
            timeout,
            retry_after,
        }
    }

    fn publish_outcome(
        &self,
        service_id: &str,
        request_id: Uuid,
        started: Instant,
        outcome: std::result::Result<(), &ApiError>,
    ) {
        let event = match outcome {
            Ok(()) => ResilienceEvent::RequestCompleted {
                service_id: service_id.to_string(),
                request_id,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(err) => ResilienceEvent::RequestFailed {
                service_id: service_id.to_string(),
                request_id,
                error: err.to_string(),
            },
        };
        self.events.publish(event);
    }
}
