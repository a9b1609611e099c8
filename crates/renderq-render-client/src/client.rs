//! Render service HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use renderq_engine::{RenderError, RenderPipeline, RenderedClip};
use renderq_models::RenderSpec;

use crate::types::{HealthResponse, RenderErrorBody, RenderResponse};

/// Configuration for the render service client.
#[derive(Debug, Clone)]
pub struct RenderClientConfig {
    /// Base URL of the render service
    pub base_url: String,
    /// Request timeout; renders are long-running, so this is generous
    pub timeout: Duration,
}

impl Default for RenderClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8002".to_string(),
            timeout: Duration::from_secs(1800), // 30 minutes per render
        }
    }
}

impl RenderClientConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("RENDER_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8002".to_string()),
            timeout: Duration::from_secs(
                std::env::var("RENDER_SERVICE_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1800),
            ),
        }
    }
}

/// Client for the render service.
pub struct RenderServiceClient {
    http: Client,
    config: RenderClientConfig,
}

impl RenderServiceClient {
    /// Create a new render client.
    pub fn new(config: RenderClientConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self, reqwest::Error> {
        Self::new(RenderClientConfig::from_env())
    }

    /// Check if the render service is healthy.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.config.base_url);

        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<HealthResponse>().await {
                    Ok(health) => health.status == "healthy" || health.status == "ok",
                    Err(_) => false,
                }
            }
            Ok(response) => {
                warn!("Render service health check failed: {}", response.status());
                false
            }
            Err(e) => {
                warn!("Render service health check error: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl RenderPipeline for RenderServiceClient {
    async fn execute_render(&self, spec: &RenderSpec) -> Result<RenderedClip, RenderError> {
        let url = format!("{}/render", self.config.base_url);
        debug!(asset = %spec.source.asset_id, "Dispatching render to {url}");

        let response = self
            .http
            .post(&url)
            .json(spec)
            .send()
            .await
            .map_err(|e| {
                // Connection problems and timeouts are worth retrying.
                RenderError::transient(format!("render service unreachable: {e}"))
            })?;

        let status = response.status();
        if status.is_success() {
            let body: RenderResponse = response
                .json()
                .await
                .map_err(|e| RenderError::transient(format!("malformed render response: {e}")))?;
            return Ok(RenderedClip {
                artifact_ref: body.artifact_ref,
                payload: body.payload,
            });
        }

        let detail = response
            .json::<RenderErrorBody>()
            .await
            .ok()
            .and_then(|b| b.detail)
            .unwrap_or_else(|| format!("render service returned {status}"));

        // 4xx means the spec itself cannot be rendered; 5xx and 429 mean
        // the service is struggling and the work should retry.
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            Err(RenderError::permanent(detail))
        } else {
            Err(RenderError::transient(detail))
        }
    }
}
