// src/resilience/mod.rs
//! Failure handling around calls to downstream services.
//!
//! 1. **Circuit Breaking** - Stop calling a service that keeps failing and probe it for recovery
//! 2. **Retry with Exponential Backoff** - Caller-side retries for transient failures
//! 3. **Health Monitoring** - Background probes of every configured service

mod circuit_breaker;
mod exponential_backoff;
mod health_checker;

#[cfg(test)]
mod tests;

// Re-export key components
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use exponential_backoff::{retry_with_backoff, ExponentialBackoff, RetryConfig};
pub use health_checker::{HealthMonitor, HealthStatus};
