//! HTTP client for the external render service.
//!
//! The render service owns the encoding pipeline and object storage
//! (uploads, presigned URLs); this client only submits normalized specs
//! and classifies failures for the worker pool's retry handling.

pub mod client;
pub mod types;

pub use client::{RenderClientConfig, RenderServiceClient};
pub use types::{HealthResponse, RenderResponse};
