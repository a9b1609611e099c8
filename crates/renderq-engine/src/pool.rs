//! Bounded-concurrency worker pool.
//!
//! One pool per process: a fixed set of execution slots drains a bounded
//! local FIFO of admitted work. Every slot execution claims its durable
//! lease with a conditional write before rendering, refreshes the lease
//! heartbeat while it runs, and resolves the outcome to a terminal or
//! requeued state itself — the reaper only covers executions whose whole
//! process died.
//!
//! The local queue and all statistics are process-local arenas; the lease
//! table is the only state shared with sibling instances.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use renderq_models::{LeaseRecord, WorkKey};
use renderq_store::JobStore;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::render::{RenderError, RenderPipeline};
use crate::retry::{with_backoff, Backoff, FailureTracker};

/// Point-in-time queue statistics, served from process-local counters in
/// O(1) — status queries never touch the durable store.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    /// Executions currently holding a slot
    pub active: usize,
    /// Locally admitted work waiting for a slot
    pub pending: usize,
    /// Pending-queue capacity
    pub capacity: usize,
}

struct PendingQueue {
    queue: VecDeque<WorkKey>,
    /// Slots promised to in-flight admissions, not yet committed
    reserved: usize,
    closed: bool,
}

struct PoolShared {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    render: Arc<dyn RenderPipeline>,
    pending: Mutex<PendingQueue>,
    work_ready: Notify,
    slots: Arc<Semaphore>,
    active: AtomicUsize,
    /// Smoothed execution time in milliseconds; 0 until first completion
    avg_exec_ms: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

/// Worker pool handle. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

/// A promised pending-queue slot held while an admission finishes its
/// durable writes. Dropping without [`SlotReservation::commit`] returns
/// the slot.
pub struct SlotReservation {
    shared: Arc<PoolShared>,
    committed: bool,
}

impl SlotReservation {
    /// Enqueue the key into the reserved slot. Returns the 1-based local
    /// queue position.
    pub fn commit(mut self, key: WorkKey) -> usize {
        let position = {
            let mut p = self.shared.pending.lock().unwrap();
            self.committed = true;
            p.reserved = p.reserved.saturating_sub(1);
            p.queue.push_back(key);
            p.queue.len()
        };
        self.shared.work_ready.notify_one();
        position
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.committed {
            let mut p = self.shared.pending.lock().unwrap();
            p.reserved = p.reserved.saturating_sub(1);
        }
    }
}

impl WorkerPool {
    /// Create a new pool. Nothing runs until [`WorkerPool::run`].
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        render: Arc<dyn RenderPipeline>,
    ) -> Self {
        if let Err(e) = config.validate() {
            error!("Invalid engine config: {e}");
        }

        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(PoolShared {
                pending: Mutex::new(PendingQueue {
                    queue: VecDeque::new(),
                    reserved: 0,
                    closed: false,
                }),
                work_ready: Notify::new(),
                slots,
                active: AtomicUsize::new(0),
                avg_exec_ms: AtomicU64::new(0),
                shutdown_tx,
                config,
                store,
                render,
            }),
        }
    }

    /// This instance's identity in the lease table.
    pub fn instance_id(&self) -> &str {
        &self.shared.config.instance_id
    }

    /// Grace period granted to in-flight executions during shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        self.shared.config.shutdown_grace
    }

    /// Reserve a pending-queue slot for an admission in progress.
    ///
    /// Fails with `CapacityExceeded` when the queue (including other
    /// uncommitted reservations) is full, and `ShuttingDown` once the
    /// pool has been closed.
    pub fn try_reserve(&self) -> EngineResult<SlotReservation> {
        let mut p = self.shared.pending.lock().unwrap();
        if p.closed {
            return Err(EngineError::ShuttingDown);
        }
        if p.queue.len() + p.reserved >= self.shared.config.max_queue_size {
            return Err(EngineError::CapacityExceeded {
                pending: p.queue.len(),
                capacity: self.shared.config.max_queue_size,
            });
        }
        p.reserved += 1;
        Ok(SlotReservation {
            shared: Arc::clone(&self.shared),
            committed: false,
        })
    }

    /// 1-based position of a key in the local pending queue.
    pub fn position(&self, key: &WorkKey) -> Option<usize> {
        let p = self.shared.pending.lock().unwrap();
        p.queue.iter().position(|k| k == key).map(|i| i + 1)
    }

    /// Estimated wait for a locally pending key: queue position times the
    /// observed average execution time.
    ///
    /// An estimate only — real latency also depends on the render
    /// collaborator and upload, and on sibling instances draining the
    /// shared table. `None` until the pool has completed at least one
    /// execution, or when the key is not locally pending.
    pub fn estimated_wait(&self, key: &WorkKey) -> Option<Duration> {
        let avg_ms = self.shared.avg_exec_ms.load(Ordering::Relaxed);
        if avg_ms == 0 {
            return None;
        }
        self.position(key)
            .map(|pos| Duration::from_millis(avg_ms.saturating_mul(pos as u64)))
    }

    /// O(1) snapshot of pool occupancy.
    pub fn queue_stats(&self) -> QueueStats {
        let pending = self.shared.pending.lock().unwrap().queue.len();
        QueueStats {
            active: self.shared.active.load(Ordering::SeqCst),
            pending,
            capacity: self.shared.config.max_queue_size,
        }
    }

    /// Subscribe to the pool's shutdown signal.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shared.shutdown_tx.subscribe()
    }

    /// Close the pool: refuse new admissions and stop dispatching.
    /// In-flight executions keep running.
    pub fn close(&self) {
        self.shared.pending.lock().unwrap().closed = true;
        // send_replace stores the value even with no receiver subscribed.
        self.shared.shutdown_tx.send_replace(true);
        // Wake the dispatcher if it is parked on an empty queue.
        self.shared.work_ready.notify_one();
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.pending.lock().unwrap().closed
    }

    /// Wait until no execution holds a slot, bounded by `grace`.
    /// Returns `false` if executions were still running when it expired.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let idle = async {
            loop {
                let slots_free = self.shared.slots.available_permits()
                    == self.shared.config.max_concurrent;
                if slots_free && self.shared.active.load(Ordering::SeqCst) == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(grace, idle).await.is_ok()
    }

    /// Run the dispatcher until shutdown.
    ///
    /// Spawns the queued-lease pickup task, then loops: take an execution
    /// slot, take the next locally pending key, claim its lease, execute.
    pub async fn run(&self) {
        info!(
            instance = %self.shared.config.instance_id,
            max_concurrent = self.shared.config.max_concurrent,
            max_queue = self.shared.config.max_queue_size,
            "Starting worker pool"
        );

        let pickup = tokio::spawn(pickup_loop(
            Arc::clone(&self.shared),
            self.shared.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();

        'dispatch: loop {
            // Take a slot first so pending counts stay truthful while we
            // wait for capacity.
            let permit = tokio::select! {
                permit = Arc::clone(&self.shared.slots).acquire_owned() => {
                    match permit {
                        Ok(p) => p,
                        Err(_) => break 'dispatch,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break 'dispatch;
                    }
                    continue 'dispatch;
                }
            };

            // Wait for the next locally pending key.
            let key = loop {
                if *shutdown_rx.borrow() {
                    break 'dispatch;
                }
                if let Some(key) = self.pop_front() {
                    break key;
                }
                tokio::select! {
                    _ = self.shared.work_ready.notified() => {}
                    _ = shutdown_rx.changed() => {}
                }
            };

            match self.shared.store.claim(&key, &self.shared.config.instance_id).await {
                Ok(Some(lease)) => {
                    self.shared.active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(execute_one(Arc::clone(&self.shared), permit, lease));
                }
                Ok(None) => {
                    // A sibling instance claimed it, or it already went
                    // terminal. Nothing to do locally.
                    debug!(key = %key, "Lease not claimable, skipping");
                }
                Err(e) => {
                    warn!(key = %key, "Lease claim failed, requeueing locally: {e}");
                    self.push_back(key);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }

        pickup.abort();
        info!(instance = %self.shared.config.instance_id, "Worker pool stopped");
    }

    fn pop_front(&self) -> Option<WorkKey> {
        self.shared.pending.lock().unwrap().queue.pop_front()
    }

    fn push_back(&self, key: WorkKey) {
        let mut p = self.shared.pending.lock().unwrap();
        if !p.queue.contains(&key) {
            p.queue.push_back(key);
        }
        drop(p);
        self.shared.work_ready.notify_one();
    }
}

/// Periodically pull queued leases from the store into free local
/// capacity. This is how work released by the reaper or by a sibling's
/// shutdown gets picked up by surviving instances.
async fn pickup_loop(shared: Arc<PoolShared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.pickup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = FailureTracker::new(3);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let free = {
                    let p = shared.pending.lock().unwrap();
                    if p.closed {
                        break;
                    }
                    shared
                        .config
                        .max_queue_size
                        .saturating_sub(p.queue.len() + p.reserved)
                };
                if free == 0 {
                    continue;
                }

                match shared.store.list_queued(free).await {
                    Ok(leases) => {
                        failures.success();
                        let mut picked = 0usize;
                        for lease in leases {
                            let mut p = shared.pending.lock().unwrap();
                            if p.closed {
                                break;
                            }
                            let full =
                                p.queue.len() + p.reserved >= shared.config.max_queue_size;
                            if !full && !p.queue.contains(&lease.key) {
                                p.queue.push_back(lease.key.clone());
                                picked += 1;
                                drop(p);
                                shared.work_ready.notify_one();
                            }
                        }
                        if picked > 0 {
                            debug!("Picked up {picked} queued leases from the store");
                        }
                    }
                    Err(e) => {
                        if failures.failure() {
                            warn!("Queued-lease pickup failed: {e}");
                        }
                    }
                }
            }
        }
    }
}

/// Execute one claimed lease to resolution.
async fn execute_one(shared: Arc<PoolShared>, permit: OwnedSemaphorePermit, lease: LeaseRecord) {
    let _permit = permit;
    let key = lease.key.clone();
    let owner = shared.config.instance_id.clone();
    let started = Instant::now();

    let result = async {
        let product = shared
            .store
            .get_product(&key)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| RenderError::transient("work product missing for claimed lease"))?;

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&shared),
            key.clone(),
            owner.clone(),
        ));

        let outcome = tokio::time::timeout(
            shared.config.render_timeout,
            shared.render.execute_render(&product.spec),
        )
        .await;
        heartbeat.abort();

        match outcome {
            Ok(result) => result,
            Err(_) => Err(RenderError::transient(format!(
                "render timed out after {}s",
                shared.config.render_timeout.as_secs()
            ))),
        }
    }
    .await;

    match result {
        Ok(clip) => {
            let elapsed = started.elapsed();
            let write = with_backoff(&Backoff::default(), "complete_product", || {
                shared.store.complete(&key, &clip.artifact_ref, &clip.payload)
            })
            .await;

            match write {
                Ok(true) => {
                    record_exec_time(&shared, elapsed);
                    info!(
                        key = %key,
                        elapsed_ms = elapsed.as_millis() as u64,
                        artifact = %clip.artifact_ref,
                        "Render completed"
                    );
                }
                Ok(false) => {
                    // Lost the terminal write: the lease was reaped and a
                    // sibling finished first. The surviving result stands.
                    warn!(key = %key, "Completed result superseded by another instance");
                }
                Err(e) => error!(key = %key, "Failed to persist completed result: {e}"),
            }
        }
        Err(err) => {
            // attempt_count counts finished attempts; this one makes +1.
            let attempts = lease.attempt_count + 1;
            if err.is_retryable() && attempts < shared.config.max_attempts {
                info!(
                    key = %key,
                    attempt = attempts,
                    max_attempts = shared.config.max_attempts,
                    "Transient render failure, requeueing: {err}"
                );
                match shared.store.requeue(&key, &owner, &err.to_string()).await {
                    Ok(true) => {}
                    Ok(false) => warn!(key = %key, "Requeue lost: lease no longer owned"),
                    Err(e) => error!(key = %key, "Failed to requeue lease: {e}"),
                }
            } else {
                warn!(
                    key = %key,
                    attempt = attempts,
                    "Render failed terminally: {err}"
                );
                let err_message = err.to_string();
                let write = with_backoff(&Backoff::default(), "fail_product", || {
                    shared.store.fail(&key, &err_message)
                })
                .await;
                match write {
                    Ok(true) => {}
                    Ok(false) => warn!(key = %key, "Failure write lost: product already terminal"),
                    Err(e) => error!(key = %key, "Failed to persist failure: {e}"),
                }
            }
        }
    }

    shared.active.fetch_sub(1, Ordering::SeqCst);
}

/// Refresh the lease heartbeat until aborted or the lease is lost.
async fn heartbeat_loop(shared: Arc<PoolShared>, key: WorkKey, owner: String) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The claim itself stamped the first heartbeat.
    ticker.tick().await;

    let mut failures = FailureTracker::new(3);
    loop {
        ticker.tick().await;
        match shared.store.heartbeat(&key, &owner).await {
            Ok(true) => failures.success(),
            Ok(false) => {
                warn!(key = %key, "Lease no longer owned by this instance, stopping heartbeats");
                break;
            }
            Err(e) => {
                if failures.failure() {
                    warn!(key = %key, "Heartbeat write failed: {e}");
                }
            }
        }
    }
}

fn record_exec_time(shared: &PoolShared, elapsed: Duration) {
    let sample = elapsed.as_millis().max(1) as u64;
    let old = shared.avg_exec_ms.load(Ordering::Relaxed);
    let next = if old == 0 { sample } else { (old * 4 + sample) / 5 };
    shared.avg_exec_ms.store(next, Ordering::Relaxed);
}
