//! Lease reaper.
//!
//! Reclaims leases abandoned by workers that died without resolving their
//! claim: a processing lease whose heartbeat (or, failing that, claim
//! timestamp) predates the staleness cutoff. Recovery is a conditional
//! write asserting the observed owner, so a worker that was merely slow
//! and heartbeats between scan and reset keeps its lease.
//!
//! Crash-retry policy is increment-with-cap: each recovery counts as a
//! failed attempt, and at the attempt budget the product fails terminally
//! instead of requeueing — a render path that kills its worker every time
//! must not retry forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use renderq_store::JobStore;

use crate::config::EngineConfig;
use crate::error::EngineResult;

/// How many drifted products to reconcile per cycle.
const RECONCILE_BATCH: usize = 100;

/// Result of one reaper cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReapOutcome {
    /// Stale leases reset to queued
    pub reclaimed: u32,
    /// Stale leases whose crash budget was exhausted (product failed)
    pub failed: u32,
    /// Drifted products that got their lease row recreated
    pub reconciled: u32,
}

/// Background reaper service.
pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    cutoff: Duration,
    interval: Duration,
    max_attempts: u32,
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn JobStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            cutoff: config.lease_cutoff,
            interval: config.reaper_interval,
            max_attempts: config.max_attempts,
        }
    }

    /// Run the periodic scan loop until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            cutoff_secs = self.cutoff.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting lease reaper"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Reaper cycle failed: {e}");
                    }
                }
            }
        }

        info!("Lease reaper stopped");
    }

    /// Run a single reap cycle. Also the on-demand trigger path.
    pub async fn run_once(&self) -> EngineResult<ReapOutcome> {
        let mut outcome = ReapOutcome::default();
        let cutoff_secs = self.cutoff.as_secs() as i64;

        for lease in self.store.list_stale(cutoff_secs).await? {
            let Some(owner) = lease.owner_instance_id.clone() else {
                // Processing without an owner breaks the lease invariant;
                // nothing can legally recover it by CAS. Log loudly.
                error!(key = %lease.key, "Processing lease with no owner, skipping");
                continue;
            };

            warn!(
                key = %lease.key,
                owner = %owner,
                attempt_count = lease.attempt_count,
                heartbeat_at = ?lease.heartbeat_at,
                "Detected stale lease (worker presumed dead)"
            );

            if lease.attempt_count + 1 >= self.max_attempts {
                // Crash budget exhausted.
                let failed = self
                    .store
                    .fail(
                        &lease.key,
                        "Processing was interrupted repeatedly and the retry budget is exhausted.",
                    )
                    .await?;
                if failed {
                    outcome.failed += 1;
                    warn!(key = %lease.key, "Stale lease exceeded attempt budget, failed terminally");
                }
            } else if self.store.recover_stale(&lease.key, &owner).await? {
                outcome.reclaimed += 1;
                info!(key = %lease.key, "Reclaimed stale lease");
            }
            // A lost CAS here means the worker came back or a sibling
            // reaper won; either way the lease is in good hands.
        }

        // Defense in depth: a non-terminal product with no lease row can
        // never be claimed again. Recreate the lease so it re-enters the
        // pool.
        for product in self.store.list_unleased(RECONCILE_BATCH).await? {
            if self.store.ensure_lease(&product.key).await? {
                outcome.reconciled += 1;
                warn!(key = %product.key, "Recreated missing lease for live product");
            }
        }

        if outcome.reclaimed > 0 || outcome.failed > 0 || outcome.reconciled > 0 {
            info!(
                reclaimed = outcome.reclaimed,
                failed = outcome.failed,
                reconciled = outcome.reconciled,
                "Reap cycle complete"
            );
        }

        Ok(outcome)
    }
}
