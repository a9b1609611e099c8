//! Render service wire types.

use serde::{Deserialize, Serialize};

use renderq_models::ResultPayload;

/// Successful render response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResponse {
    /// Storage locator of the uploaded artifact
    pub artifact_ref: String,
    /// Kind-specific result payload
    pub payload: ResultPayload,
}

/// Error body returned on render failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RenderErrorBody {
    pub detail: Option<String>,
}

/// Health check response.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
