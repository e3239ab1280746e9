// src/test_utils.rs

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SystemClock;
use crate::config::ServiceConfig;
use crate::error::{ApiError, Result};
use crate::manager::{ApiManager, ApiResponse, HttpRequest, Transport};

/// Scripted transport: answers 200 after an optional delay, or 503 while failing
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let transport = Self::default();
        *transport.delay.lock() = delay;
        Arc::new(transport)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Requests in the order they reached the transport
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Paths of the requests in arrival order, with the base URL stripped
    pub fn paths(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| match r.url.find("://") {
                Some(scheme_end) => {
                    let rest = &r.url[scheme_end + 3..];
                    rest.find('/').map_or("/".to_string(), |i| rest[i..].to_string())
                }
                None => r.url.clone(),
            })
            .collect()
    }
}

// Leaves the in-flight count when a send completes or is cancelled
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<ApiResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let service_id = request.service_id.clone();
        self.requests.lock().push(request);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::OperationFailed {
                service_id,
                status: Some(503),
                message: "HTTP 503 Service Unavailable".to_string(),
            });
        }

        Ok(ApiResponse {
            status: 200,
            headers: HashMap::new(),
            body: r#"{"ok":true}"#.to_string(),
            elapsed: delay,
        })
    }
}

/// Manager on the system clock with `service` pointed at a mock base URL
pub fn manager_with_service(transport: Arc<MockTransport>, service: ServiceConfig) -> ApiManager {
    let manager = ApiManager::with_transport(transport, Arc::new(SystemClock));
    manager
        .configure_service(service)
        .expect("valid service config");
    manager
}

pub fn service(service_id: &str) -> ServiceConfig {
    ServiceConfig::new(service_id, &format!("http://{}.test", service_id))
}
