// for error definitions
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Suspension point at which a request ran out of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStage {
    /// Waiting in the queue for rate-limit capacity
    RateLimit,
    /// Waiting in the queue for a connection pool slot
    ConnectionPool,
    /// The underlying call was in flight
    Execution,
}

impl fmt::Display for WaitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            WaitStage::RateLimit => "rate limit",
            WaitStage::ConnectionPool => "connection pool",
            WaitStage::Execution => "execution",
        };
        f.write_str(stage)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// Returned when a request was denied because the service is out of capacity
    #[error("Rate limit exceeded for {service_id}: retry after {wait_time:?}")]
    RateLimitExceeded {
        service_id: String,
        wait_time: Duration,
    },

    /// The circuit breaker for the service is open
    #[error("Circuit open for {service_id}: retry after {retry_after:?}")]
    CircuitOpen {
        service_id: String,
        retry_after: Duration,
    },

    /// No pool slot (or queue position) was available
    #[error("Connection pool exhausted for {service_id} ({max_concurrent} active, {queued} queued)")]
    ConnectionPoolExhausted {
        service_id: String,
        max_concurrent: usize,
        queued: usize,
    },

    /// A request ran out of time at one of its suspension points
    #[error("Request to {service_id} timed out after {timeout:?} during {stage}")]
    RequestTimeout {
        service_id: String,
        stage: WaitStage,
        timeout: Duration,
        retry_after: Option<Duration>,
    },

    /// The wrapped operation itself failed
    #[error("Operation against {service_id} failed: {message}")]
    OperationFailed {
        service_id: String,
        status: Option<u16>,
        message: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A service id with no registered configuration was used where one is required
    #[error("Unknown service: {0}")]
    UnknownService(String),
}

impl ApiError {
    /// Wraps an arbitrary failure of a protected operation
    pub fn operation_failed(service_id: &str, message: impl fmt::Display) -> Self {
        ApiError::OperationFailed {
            service_id: service_id.to_string(),
            status: None,
            message: message.to_string(),
        }
    }

    /// Service the error refers to, if any
    pub fn service_id(&self) -> Option<&str> {
        match self {
            ApiError::RateLimitExceeded { service_id, .. }
            | ApiError::CircuitOpen { service_id, .. }
            | ApiError::ConnectionPoolExhausted { service_id, .. }
            | ApiError::RequestTimeout { service_id, .. }
            | ApiError::OperationFailed { service_id, .. } => Some(service_id),
            ApiError::UnknownService(service_id) => Some(service_id),
            ApiError::Config(_) => None,
        }
    }

    /// Server-provided or computed hint for how long to wait before retrying
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimitExceeded { wait_time, .. } => Some(*wait_time),
            ApiError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            ApiError::RequestTimeout { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether a caller-side retry can reasonably succeed.
    ///
    /// An open circuit is never retryable: it was tripped on purpose.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimitExceeded { .. }
            | ApiError::ConnectionPoolExhausted { .. }
            | ApiError::RequestTimeout { .. } => true,
            ApiError::OperationFailed { status, .. } => match status {
                Some(code) => *code == 429 || *code >= 500,
                None => true,
            },
            ApiError::CircuitOpen { .. } | ApiError::Config(_) | ApiError::UnknownService(_) => {
                false
            }
        }
    }
}

// implement conversions from serde_json::Error to ApiError
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Config(format!("invalid settings document: {}", err))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Config(format!("unable to read settings: {}", err))
    }
}

// reqwest errors carry no service id, so transports map them with the id they know
pub(crate) fn from_reqwest(service_id: &str, err: reqwest::Error) -> ApiError {
    ApiError::OperationFailed {
        service_id: service_id.to_string(),
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, ApiError>;
