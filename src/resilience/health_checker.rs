use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;
use crate::manager::{ApiManager, HealthCheckResult};

/// Last known health of one service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Periodically probes every configured service through the manager
#[derive(Debug)]
pub struct HealthMonitor {
    manager: Arc<ApiManager>,
    config: HealthCheckConfig,
    statuses: Arc<DashMap<String, HealthStatus>>,
    /// Cancel flag for the background task
    cancel_flag: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<ApiManager>, config: HealthCheckConfig) -> Self {
        Self {
            manager,
            config,
            statuses: Arc::new(DashMap::new()),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background task
    pub fn start(&self) -> task::JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let statuses = Arc::clone(&self.statuses);
        let cancel_flag = Arc::clone(&self.cancel_flag);
        let interval = self.config.check_interval;
        let timeout = self.config.check_timeout;

        task::spawn(async move {
            let mut interval_timer = time::interval(interval);

            loop {
                interval_timer.tick().await;

                if cancel_flag.load(Ordering::SeqCst) {
                    break;
                }

                check_all(&manager, &statuses, timeout).await;
            }

            debug!("Health monitor task stopped");
        })
    }

    /// Runs one round of checks immediately
    pub async fn check_now(&self) -> Vec<HealthCheckResult> {
        check_all(&self.manager, &self.statuses, self.config.check_timeout).await
    }

    /// Stops the background task before its next round
    pub fn stop(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Services that were never checked are assumed healthy
    pub fn is_healthy(&self, service_id: &str) -> bool {
        self.statuses
            .get(service_id)
            .map_or(true, |status| status.healthy)
    }

    pub fn status(&self, service_id: &str) -> Option<HealthStatus> {
        self.statuses.get(service_id).map(|s| s.value().clone())
    }
}

async fn check_all(
    manager: &ApiManager,
    statuses: &DashMap<String, HealthStatus>,
    timeout: Duration,
) -> Vec<HealthCheckResult> {
    let mut results = Vec::new();

    for service_id in manager.configured_services() {
        let result = manager.probe(&service_id, Some(timeout)).await;
        update_status(statuses, &result);
        results.push(result);
    }

    results
}

fn update_status(statuses: &DashMap<String, HealthStatus>, result: &HealthCheckResult) {
    let previous = statuses.get(&result.service_id).map(|s| s.value().clone());
    let was_healthy = previous.as_ref().map_or(true, |s| s.healthy);

    let consecutive_failures = match (&previous, result.healthy) {
        (_, true) => 0,
        (Some(status), false) => status.consecutive_failures + 1,
        (None, false) => 1,
    };

    if was_healthy != result.healthy {
        if result.healthy {
            info!(service_id = %result.service_id, "Service is now healthy");
        } else {
            warn!(
                service_id = %result.service_id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Service is now unhealthy"
            );
        }
    }

    statuses.insert(
        result.service_id.clone(),
        HealthStatus {
            healthy: result.healthy,
            last_checked: Utc::now(),
            last_error: result.error.clone(),
            consecutive_failures,
        },
    );
}
