// library entry
pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod rate_limiter;
pub mod resilience;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod tests;

// Re-export key components for convenience
pub use algorithms::{RateLimitStatus, RateLimitStrategy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CircuitBreakerConfig, HealthCheckConfig, RateLimitConfig, ResilienceSettings, ServiceConfig,
    StrategyKind,
};
pub use error::{ApiError, Result, WaitStage};
pub use events::{EventBus, ResilienceEvent};
pub use logging::init as init_logging;
pub use manager::{ApiManager, ApiResponse, Priority, RequestOptions};
pub use rate_limiter::RateLimiter;
pub use resilience::{CircuitBreaker, CircuitState};
