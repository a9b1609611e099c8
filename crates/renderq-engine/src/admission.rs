//! Admission gate.
//!
//! Decides whether a request returns a cached artifact, attaches to
//! in-flight work, or creates new durable state. The unique constraint on
//! the work key is the single source of truth for dedup: a lost insert
//! race is resolved by re-reading the winner, never surfaced as an error.

use std::sync::Arc;

use tracing::{debug, info};

use renderq_models::{ProductStatus, WorkKey, WorkProduct, WorkRequest};
use renderq_store::JobStore;

use crate::error::{EngineError, EngineResult};
use crate::pool::WorkerPool;
use crate::quota::{QuotaDecision, QuotaGate};

/// Outcome of a submission.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The artifact already exists; no work was scheduled.
    Completed {
        poll_token: WorkKey,
        artifact_ref: String,
    },
    /// Work is queued or already running; poll with the token. Covers the
    /// duplicate-in-progress case — attaching to existing work is a
    /// normal response, not a failure.
    Accepted {
        poll_token: WorkKey,
        queue_position: Option<usize>,
    },
}

/// Dedup-and-create entry point.
pub struct AdmissionGate {
    store: Arc<dyn JobStore>,
    quota: Arc<dyn QuotaGate>,
    pool: WorkerPool,
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn JobStore>, quota: Arc<dyn QuotaGate>, pool: WorkerPool) -> Self {
        Self { store, quota, pool }
    }

    /// Submit a render request.
    ///
    /// Order matters: validation, then the upstream quota check, then the
    /// content-addressed lookup. A validation or quota rejection must
    /// leave no durable trace and consume no queue slot.
    pub async fn submit(
        &self,
        request: &WorkRequest,
        identity: &str,
    ) -> EngineResult<SubmitOutcome> {
        let spec = request.normalize()?;

        if let QuotaDecision::Deny(reason) = self.quota.check_quota(identity, spec.kind).await {
            return Err(EngineError::QuotaExceeded(reason));
        }

        let key = WorkKey::compute(&spec);

        // Short-circuit on existing state before touching the queue.
        if let Some(existing) = self.store.get_product(&key).await? {
            debug!(key = %key, status = %existing.status, "Submission matched existing work");
            return Ok(self.resolve_existing(existing));
        }

        // Insert before taking a local slot: concurrent duplicates then
        // contend on the unique key, never on queue capacity, so a
        // duplicate can never be misreported as CapacityExceeded.
        let product = WorkProduct::new_queued(key.clone(), spec);
        if !self.store.insert_new(&product).await? {
            // Lost the insert race to a concurrent first submission:
            // attach to the winner's record.
            let existing = self.store.get_product(&key).await?.ok_or_else(|| {
                EngineError::internal("work product vanished after insert conflict")
            })?;
            debug!(key = %key, "Concurrent duplicate submission, attaching to winner");
            return Ok(self.resolve_existing(existing));
        }

        match self.pool.try_reserve() {
            Ok(slot) => {
                let position = slot.commit(key.clone());
                info!(key = %key, position, "Admitted new render work");
                Ok(SubmitOutcome::Accepted {
                    poll_token: key,
                    queue_position: Some(position),
                })
            }
            Err(reject) => {
                // No local slot: unwind the pair we just created, unless
                // a sibling instance already picked the work up, in which
                // case it is in good hands and the submission stands.
                if self.store.remove_new(&key).await? {
                    Err(reject)
                } else {
                    Ok(SubmitOutcome::Accepted {
                        poll_token: key,
                        queue_position: None,
                    })
                }
            }
        }
    }

    fn resolve_existing(&self, product: WorkProduct) -> SubmitOutcome {
        match product.status {
            ProductStatus::Completed => SubmitOutcome::Completed {
                artifact_ref: product
                    .artifact_ref
                    .unwrap_or_default(),
                poll_token: product.key,
            },
            // Queued, processing, or failed: hand back the poll token.
            // For a failed key the poll surfaces the terminal error; only
            // a semantically different request re-renders.
            _ => {
                let queue_position = self.pool.position(&product.key);
                SubmitOutcome::Accepted {
                    poll_token: product.key,
                    queue_position,
                }
            }
        }
    }
}
