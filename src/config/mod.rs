// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{ApiError, Result};

/// Rate limiting algorithm bound to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::TokenBucket => "token-bucket",
            StrategyKind::SlidingWindow => "sliding-window",
            StrategyKind::FixedWindow => "fixed-window",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.replace('_', "-").as_str() {
            "token-bucket" => Ok(StrategyKind::TokenBucket),
            "sliding-window" => Ok(StrategyKind::SlidingWindow),
            "fixed-window" => Ok(StrategyKind::FixedWindow),
            other => Err(ApiError::Config(format!("unknown strategy: {}", other))),
        }
    }
}

/// Rate limit configuration for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub service_id: String,

    pub strategy: StrategyKind,

    /// Requests allowed per window
    pub limit: u64,

    /// Window length
    #[serde(rename = "windowMs", with = "duration_ms")]
    pub window: Duration,

    /// Token bucket capacity; defaults to `limit`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u64>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RateLimitConfig {
    pub fn new(service_id: &str, strategy: StrategyKind, limit: u64, window: Duration) -> Self {
        Self {
            service_id: service_id.to_string(),
            strategy,
            limit,
            window,
            burst: None,
            enabled: true,
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Policy applied to services nobody configured: 10 requests per second, sliding window
    pub fn default_for(service_id: &str) -> Self {
        Self::new(
            service_id,
            StrategyKind::SlidingWindow,
            10,
            Duration::from_millis(1000),
        )
    }

    pub fn window_millis(&self) -> u64 {
        self.window.as_millis() as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(ApiError::Config(format!(
                "rate limit for {} must be greater than zero",
                self.service_id
            )));
        }
        if self.window_millis() == 0 {
            return Err(ApiError::Config(format!(
                "rate limit window for {} must be at least 1ms",
                self.service_id
            )));
        }
        if self.burst == Some(0) {
            return Err(ApiError::Config(format!(
                "burst for {} must be greater than zero",
                self.service_id
            )));
        }
        Ok(())
    }
}

/// Circuit breaker configuration for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub service_id: String,

    /// Failures inside the monitoring window that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open before allowing trial calls
    #[serde(
        rename = "recoveryTimeoutMs",
        default = "default_recovery_timeout",
        with = "duration_ms"
    )]
    pub recovery_timeout: Duration,

    /// Consecutive half-open successes needed to close again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Failures older than this are forgotten
    #[serde(
        rename = "monitoringWindowMs",
        default = "default_monitoring_window",
        with = "duration_ms"
    )]
    pub monitoring_window: Duration,

    /// Concurrent trial calls allowed while half-open; defaults to `success_threshold`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_max_calls: Option<u32>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_success_threshold() -> u32 {
    3
}

fn default_monitoring_window() -> Duration {
    Duration::from_secs(60)
}

impl CircuitBreakerConfig {
    pub fn new(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            success_threshold: default_success_threshold(),
            monitoring_window: default_monitoring_window(),
            half_open_max_calls: None,
            enabled: true,
        }
    }

    pub fn half_open_limit(&self) -> u32 {
        self.half_open_max_calls
            .unwrap_or(self.success_threshold)
            .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ApiError::Config(format!(
                "circuit breaker thresholds for {} must be greater than zero",
                self.service_id
            )));
        }
        if self.monitoring_window.is_zero() {
            return Err(ApiError::Config(format!(
                "monitoring window for {} must be at least 1ms",
                self.service_id
            )));
        }
        Ok(())
    }
}

/// Connection pool and request defaults for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub service_id: String,

    #[serde(rename = "baseURL", alias = "baseUrl")]
    pub base_url: String,

    /// Default per-request timeout
    #[serde(rename = "timeoutMs", default = "default_request_timeout", with = "duration_ms")]
    pub timeout: Duration,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Path probed by health checks, relative to `base_url`
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// When false, a rate-limited request fails immediately instead of queueing
    #[serde(default = "default_enabled")]
    pub queue_when_limited: bool,

    /// Upper bound on requests waiting in the queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queued: Option<usize>,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent() -> usize {
    10
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_enabled() -> bool {
    true
}

impl ServiceConfig {
    pub fn new(service_id: &str, base_url: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            base_url: base_url.to_string(),
            timeout: default_request_timeout(),
            max_concurrent: default_max_concurrent(),
            headers: HashMap::new(),
            health_path: default_health_path(),
            queue_when_limited: true,
            max_queued: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(ApiError::Config(format!(
                "maxConcurrent for {} must be greater than zero",
                self.service_id
            )));
        }
        if self.timeout.is_zero() {
            return Err(ApiError::Config(format!(
                "timeout for {} must be at least 1ms",
                self.service_id
            )));
        }
        Ok(())
    }

    /// Joins `base_url` with a path or returns `path` untouched when it is already absolute
    pub fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            format!("{}/", base)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

/// Configuration for the background health monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// How often every service is probed
    #[serde(rename = "checkIntervalMs", default = "default_check_interval", with = "duration_ms")]
    pub check_interval: Duration,

    /// Timeout for a single probe
    #[serde(rename = "checkTimeoutMs", default = "default_check_timeout", with = "duration_ms")]
    pub check_timeout: Duration,
}

fn default_check_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            check_timeout: default_check_timeout(),
        }
    }
}

/// Complete settings document consumed from the surrounding application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceSettings {
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,

    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerConfig>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Policy for services without a rate limit entry; `None` uses 10 req/s sliding window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl ResilienceSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        for config in &self.rate_limits {
            config.validate()?;
        }
        for config in &self.circuit_breakers {
            config.validate()?;
        }
        for config in &self.services {
            config.validate()?;
        }
        if let Some(default) = &self.default_rate_limit {
            default.validate()?;
        }
        Ok(())
    }
}

// Helper module to serialize/deserialize Duration as milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
