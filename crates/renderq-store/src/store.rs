//! The durable coordination surface.
//!
//! Workers on separate hosts share nothing but these tables, so every
//! mutation that competes across instances asserts its expected prior
//! state as a precondition and reports whether it won. Callers must treat
//! a `false` return as "someone else got there first", not as an error.

use async_trait::async_trait;

use renderq_models::{LeaseRecord, ResultPayload, WorkKey, WorkProduct};

use crate::error::StoreResult;

/// Durable two-table job store: work products and execution leases.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically create `WorkProduct(queued)` + `LeaseRecord(queued)` for
    /// a first-time key.
    ///
    /// Returns `false` when the key already exists (unique-constraint
    /// conflict); the caller resolves by re-reading the winner. Never
    /// fails on a duplicate.
    async fn insert_new(&self, product: &WorkProduct) -> StoreResult<bool>;

    /// Compensating removal of a just-created pair that could not be
    /// enqueued locally (pending queue filled up in between): deletes the
    /// product and lease only while both are still queued and unowned.
    ///
    /// Returns `false` when a sibling instance already started on the
    /// work — the caller then attaches to it instead of rejecting.
    async fn remove_new(&self, key: &WorkKey) -> StoreResult<bool>;

    /// Fetch the product for a key.
    async fn get_product(&self, key: &WorkKey) -> StoreResult<Option<WorkProduct>>;

    /// Fetch the lease for a key.
    async fn get_lease(&self, key: &WorkKey) -> StoreResult<Option<LeaseRecord>>;

    /// Claim a queued lease for `owner`: queued + unowned → processing,
    /// setting claimed/heartbeat/started timestamps and moving the product
    /// to processing.
    ///
    /// Returns the claimed lease, or `None` if the lease was not claimable
    /// (already taken by a sibling instance, or no longer queued).
    async fn claim(&self, key: &WorkKey, owner: &str) -> StoreResult<Option<LeaseRecord>>;

    /// Refresh the heartbeat on a lease still owned by `owner`.
    ///
    /// Returns `false` when the lease is no longer held by this owner —
    /// the reaper presumed the worker dead and reclaimed it.
    async fn heartbeat(&self, key: &WorkKey, owner: &str) -> StoreResult<bool>;

    /// Terminal success: product → completed with artifact and payload,
    /// lease freed. Conditional on the product not already being terminal;
    /// returns `false` (touching nothing) when it is.
    async fn complete(
        &self,
        key: &WorkKey,
        artifact_ref: &str,
        payload: &ResultPayload,
    ) -> StoreResult<bool>;

    /// Terminal failure: product → failed with the error, lease freed.
    /// Conditional on the product not already being terminal.
    async fn fail(&self, key: &WorkKey, error: &str) -> StoreResult<bool>;

    /// Transient-failure requeue by the owning worker: processing lease
    /// held by `owner` → queued with `attempt_count + 1` and the error
    /// recorded; product back to queued.
    async fn requeue(&self, key: &WorkKey, owner: &str, last_error: &str) -> StoreResult<bool>;

    /// Release every processing lease owned by `owner` back to queued,
    /// clearing ownership and heartbeat. Attempt counts are untouched — a
    /// planned release is not a failed attempt. Returns the released keys.
    async fn release_owned(&self, owner: &str) -> StoreResult<Vec<WorkKey>>;

    /// Processing leases whose liveness signal predates `cutoff_secs`:
    /// heartbeat older than the cutoff, or no heartbeat and a claim older
    /// than the cutoff.
    async fn list_stale(&self, cutoff_secs: i64) -> StoreResult<Vec<LeaseRecord>>;

    /// Reaper recovery of one stale lease: conditional on it still being
    /// processing under `expected_owner`, reset to queued with
    /// owner/claimed/heartbeat/started/last_error cleared and
    /// `attempt_count + 1`; product back to queued.
    async fn recover_stale(&self, key: &WorkKey, expected_owner: &str) -> StoreResult<bool>;

    /// Queued leases available for pickup, oldest first.
    async fn list_queued(&self, limit: usize) -> StoreResult<Vec<LeaseRecord>>;

    /// Non-terminal products that have lost their lease row (drift between
    /// the two tables).
    async fn list_unleased(&self, limit: usize) -> StoreResult<Vec<WorkProduct>>;

    /// Recreate a queued lease for a drifted product. Returns `false` if a
    /// lease row already exists.
    async fn ensure_lease(&self, key: &WorkKey) -> StoreResult<bool>;
}
