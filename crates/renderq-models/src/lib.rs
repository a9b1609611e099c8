//! Shared data models for the RenderQ clip pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Render requests and their normalized form
//! - Content-addressed work fingerprints
//! - Durable work products (results) and execution leases
//! - Request validation errors

pub mod lease;
pub mod product;
pub mod request;
pub mod work_key;

// Re-export common types
pub use lease::{LeaseRecord, LeaseStatus};
pub use product::{ProductStatus, ResultPayload, WorkKind, WorkProduct};
pub use request::{
    Aspect, ClipOptions, RenderSpec, RequestError, SourceRef, TimeRange, WorkRequest,
};
pub use work_key::{WorkKey, WorkKeyError};
