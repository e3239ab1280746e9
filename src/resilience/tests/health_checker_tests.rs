// src/resilience/tests/health_checker_tests.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::config::{HealthCheckConfig, ServiceConfig};
use crate::resilience::HealthMonitor;
use crate::test_utils::{manager_with_service, service, MockTransport};

fn monitor(transport: Arc<MockTransport>, interval_ms: u64) -> HealthMonitor {
    let manager = manager_with_service(
        transport,
        ServiceConfig {
            health_path: "/health".to_string(),
            ..service("orders")
        },
    );
    HealthMonitor::new(
        Arc::new(manager),
        HealthCheckConfig {
            check_interval: Duration::from_millis(interval_ms),
            check_timeout: Duration::from_millis(100),
        },
    )
}

#[tokio::test]
async fn test_unchecked_services_are_assumed_healthy() {
    let monitor = monitor(MockTransport::new(), 1_000);

    assert!(monitor.is_healthy("orders"));
    assert!(monitor.status("orders").is_none());
}

#[tokio::test]
async fn test_check_now_probes_health_path() {
    let transport = MockTransport::new();
    let monitor = monitor(transport.clone(), 1_000);

    let results = monitor.check_now().await;

    assert_eq!(results.len(), 1);
    assert!(results[0].healthy);
    assert_eq!(transport.paths(), vec!["/health"]);
    assert!(monitor.is_healthy("orders"));
}

#[tokio::test]
async fn test_tracks_transitions_and_consecutive_failures() {
    let transport = MockTransport::new();
    let monitor = monitor(transport.clone(), 1_000);

    transport.set_failing(true);
    monitor.check_now().await;
    monitor.check_now().await;

    let status = monitor.status("orders").unwrap();
    assert!(!status.healthy);
    assert_eq!(status.consecutive_failures, 2);
    assert!(status.last_error.unwrap().contains("503"));
    assert!(!monitor.is_healthy("orders"));

    transport.set_failing(false);
    monitor.check_now().await;

    let status = monitor.status("orders").unwrap();
    assert!(status.healthy);
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_slow_probe_is_unhealthy() {
    let transport = MockTransport::with_delay(Duration::from_millis(300));
    let monitor = monitor(transport, 1_000);

    let results = monitor.check_now().await;

    assert!(!results[0].healthy);
    assert!(results[0].error.as_deref().unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn test_background_task_runs_until_stopped() {
    let transport = MockTransport::new();
    let monitor = monitor(transport.clone(), 20);

    let handle = monitor.start();
    time::sleep(Duration::from_millis(90)).await;
    assert!(transport.calls() >= 2);

    monitor.stop();
    time::timeout(Duration::from_millis(200), handle)
        .await
        .expect("task should stop")
        .unwrap();

    let calls = transport.calls();
    time::sleep(Duration::from_millis(60)).await;
    assert_eq!(transport.calls(), calls);
}
