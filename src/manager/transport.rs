// src/manager/transport.rs

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{from_reqwest, ApiError, Result};

/// A fully resolved outbound call, as handed to a [`Transport`]
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub request_id: Uuid,
    pub service_id: String,
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
    /// Time left before the caller's deadline
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub elapsed: Duration,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Performs the network call for a request that made it through the pipeline
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn send(&self, request: HttpRequest) -> Result<ApiResponse>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<ApiResponse> {
        let started = Instant::now();
        let service_id = request.service_id;

        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(request.timeout)
            .header("x-request-id", request.request_id.to_string());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| from_reqwest(&service_id, err))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|err| from_reqwest(&service_id, err))?;

        if !status.is_success() {
            return Err(ApiError::OperationFailed {
                service_id,
                status: Some(status.as_u16()),
                message: format!("HTTP {}", status),
            });
        }

        Ok(ApiResponse {
            status: status.as_u16(),
            headers,
            body,
            elapsed: started.elapsed(),
        })
    }
}
