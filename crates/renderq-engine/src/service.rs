//! Service facade over the pipeline components.
//!
//! One object wiring admission, pool, reaper, and store behind the four
//! operations the outer surface (REST layer, CLI, tests) consumes:
//! submit, status polling, on-demand reaping, and queue statistics.

use std::sync::Arc;

use serde::Serialize;

use renderq_models::{ProductStatus, WorkKey, WorkRequest};
use renderq_store::JobStore;

use crate::admission::{AdmissionGate, SubmitOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::pool::{QueueStats, WorkerPool};
use crate::quota::QuotaGate;
use crate::reaper::{LeaseReaper, ReapOutcome};
use crate::render::RenderPipeline;
use crate::shutdown::ShutdownCoordinator;

/// Poll response for a unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Current product status
    pub status: ProductStatus,
    /// Artifact locator once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    /// Failure description once failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 1-based local queue position while queued on this instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    /// Rough wait estimate while queued; see [`WorkerPool::estimated_wait`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<f64>,
}

/// The clip-render job pipeline as one service.
pub struct JobService {
    gate: AdmissionGate,
    pool: WorkerPool,
    reaper: Arc<LeaseReaper>,
    store: Arc<dyn JobStore>,
}

impl JobService {
    /// Wire up the pipeline. Background loops (pool dispatcher, reaper)
    /// are not started here; spawn [`JobService::pool`]'s `run` and
    /// [`JobService::reaper`]'s `run` from the host process.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        render: Arc<dyn RenderPipeline>,
        quota: Arc<dyn QuotaGate>,
    ) -> Self {
        let pool = WorkerPool::new(config.clone(), Arc::clone(&store), render);
        let gate = AdmissionGate::new(Arc::clone(&store), quota, pool.clone());
        let reaper = Arc::new(LeaseReaper::new(Arc::clone(&store), &config));

        Self {
            gate,
            pool,
            reaper,
            store,
        }
    }

    /// Submit a render request on behalf of `identity`.
    pub async fn submit(
        &self,
        request: &WorkRequest,
        identity: &str,
    ) -> EngineResult<SubmitOutcome> {
        self.gate.submit(request, identity).await
    }

    /// Resolve a poll token to the current state of its work.
    pub async fn get_status(&self, poll_token: &str) -> EngineResult<StatusResponse> {
        let key = WorkKey::parse(poll_token)?;

        let product = self
            .store
            .get_product(&key)
            .await?
            .ok_or(EngineError::UnknownToken)?;

        let (queue_position, estimated_wait_secs) = if product.status == ProductStatus::Queued {
            (
                self.pool.position(&key),
                self.pool.estimated_wait(&key).map(|d| d.as_secs_f64()),
            )
        } else {
            (None, None)
        };

        Ok(StatusResponse {
            status: product.status,
            artifact_ref: product.artifact_ref,
            error: product.error,
            queue_position,
            estimated_wait_secs,
        })
    }

    /// Run one reap cycle now, independent of the periodic schedule.
    pub async fn trigger_reaper(&self) -> EngineResult<ReapOutcome> {
        self.reaper.run_once().await
    }

    /// O(1) local queue statistics.
    pub fn queue_stats(&self) -> QueueStats {
        self.pool.queue_stats()
    }

    /// The worker pool, for spawning its dispatcher loop.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The reaper, for spawning its periodic loop.
    pub fn reaper(&self) -> Arc<LeaseReaper> {
        Arc::clone(&self.reaper)
    }

    /// Build the shutdown coordinator for this instance.
    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(self.pool.clone(), Arc::clone(&self.store))
    }
}
