use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Initialize the logging system with sensible defaults.
///
/// Log level can be set using the RUST_LOG environment variable.
/// Example: RUST_LOG=debug,api_resilience=trace
pub fn init() {
    init_with_default("info");
}

/// Same as [`init`], with a fallback filter used when RUST_LOG is unset
pub fn init_with_default(default_filter: &str) {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

        // try_init: a subscriber may already be installed by the host application
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true) // Include module path in logs
                    .with_thread_ids(true) // Useful for debugging concurrency issues
                    .with_line_number(true),
            )
            .try_init();

        if installed.is_ok() {
            tracing::info!("Logging initialized");
        }
    });
}

/// Macro for logging rate limiting decisions
#[macro_export]
macro_rules! rate_limit_event {
    ($service:expr, $allowed:expr, $remaining:expr, $wait_ms:expr, $strategy:expr) => {
        tracing::debug!(
            service_id = $service,
            allowed = $allowed,
            remaining = $remaining,
            wait_ms = $wait_ms,
            strategy = $strategy,
            "Rate limit check"
        )
    };
}

/// Macro for logging circuit breaker transitions
#[macro_export]
macro_rules! circuit_transition {
    ($service:expr, $from:expr, $to:expr, $failures:expr) => {
        tracing::warn!(
            service_id = $service,
            from = ?$from,
            to = ?$to,
            failures = $failures,
            "Circuit breaker transition"
        )
    };
}
