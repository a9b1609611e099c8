//! Clip-render job coordination.
//!
//! This crate provides:
//! - Admission gate with content-addressed dedup
//! - Bounded-concurrency worker pool with heartbeat leases
//! - Lease reaper for crashed/stalled workers
//! - Graceful shutdown with explicit lease release
//! - The `JobService` facade over all of the above

pub mod admission;
pub mod config;
pub mod error;
pub mod pool;
pub mod quota;
pub mod reaper;
pub mod render;
pub mod retry;
pub mod service;
pub mod shutdown;

pub use admission::{AdmissionGate, SubmitOutcome};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use pool::{QueueStats, WorkerPool};
pub use quota::{AllowAllQuota, QuotaDecision, QuotaGate};
pub use reaper::{LeaseReaper, ReapOutcome};
pub use render::{RenderError, RenderPipeline, RenderedClip};
pub use service::{JobService, StatusResponse};
pub use shutdown::ShutdownCoordinator;
