//! Shutdown coordinator.
//!
//! Turns a termination signal into a zero-loss drain: admissions close,
//! the dispatcher stops, in-flight executions get a bounded grace period,
//! and every lease still owned by this instance is explicitly released
//! back to queued. Siblings pick the released work up immediately instead
//! of waiting out the reaper cutoff. Process exit is deferred until the
//! release has happened.

use std::sync::Arc;

use tracing::{info, warn};

use renderq_store::JobStore;

use crate::error::EngineResult;
use crate::pool::WorkerPool;

/// Coordinates the ordered teardown of one instance.
pub struct ShutdownCoordinator {
    pool: WorkerPool,
    store: Arc<dyn JobStore>,
}

impl ShutdownCoordinator {
    pub fn new(pool: WorkerPool, store: Arc<dyn JobStore>) -> Self {
        Self { pool, store }
    }

    /// Drain and release. Call once after the termination signal; returns
    /// the number of leases handed back to the pool.
    pub async fn run(&self) -> EngineResult<usize> {
        let instance_id = self.pool.instance_id().to_string();
        let grace = self.pool.shutdown_grace();

        info!(instance = %instance_id, "Shutdown initiated, closing admissions");
        self.pool.close();

        let drained = self.pool.wait_idle(grace).await;
        if drained {
            info!(instance = %instance_id, "All in-flight executions finished");
        } else {
            warn!(
                instance = %instance_id,
                grace_secs = grace.as_secs(),
                "Grace period expired with executions still in flight, releasing their leases anyway"
            );
        }

        let released = self.store.release_owned(&instance_id).await?;
        if released.is_empty() {
            info!(instance = %instance_id, "No owned leases to release");
        } else {
            info!(
                instance = %instance_id,
                count = released.len(),
                "Released owned leases back to the queue"
            );
        }

        Ok(released.len())
    }
}
