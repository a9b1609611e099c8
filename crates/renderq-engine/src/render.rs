//! Render pipeline collaborator interface.
//!
//! The actual encoding pipeline (trim, crop, subtitle burn-in, upload) is
//! an external collaborator; the engine only needs to hand it a normalized
//! spec and classify its failures. Object storage is owned by the render
//! side — the queue never touches it directly.

use async_trait::async_trait;
use thiserror::Error;

use renderq_models::{RenderSpec, ResultPayload};

/// Successful render output.
#[derive(Debug, Clone)]
pub struct RenderedClip {
    /// External storage locator for the produced artifact
    pub artifact_ref: String,
    /// Kind-specific result payload
    pub payload: ResultPayload,
}

/// Render failure, classified for retry handling.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// Worth retrying: network hiccups, encoder contention, storage blips.
    #[error("Transient render failure: {0}")]
    Transient(String),

    /// Retrying cannot help: bad source, unsupported codec, rejected
    /// content. The work fails terminally.
    #[error("Render failed: {0}")]
    Permanent(String),
}

impl RenderError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if the failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RenderError::Transient(_))
    }
}

/// External render pipeline.
#[async_trait]
pub trait RenderPipeline: Send + Sync {
    /// Execute one render to completion, returning the stored artifact.
    async fn execute_render(&self, spec: &RenderSpec) -> Result<RenderedClip, RenderError>;
}
