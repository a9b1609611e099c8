//! End-to-end pipeline tests against the in-memory store.
//!
//! These exercise the coordination guarantees: content-addressed dedup
//! under concurrency, bounded capacity, heartbeat liveness, reaping of
//! dead workers, and zero-loss shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use renderq_engine::{
    AllowAllQuota, EngineConfig, EngineError, JobService, QuotaDecision, QuotaGate, RenderError,
    RenderPipeline, RenderedClip, SubmitOutcome,
};
use renderq_models::{
    ClipOptions, ProductStatus, RenderSpec, ResultPayload, SourceRef, TimeRange, WorkKey,
    WorkKind, WorkRequest,
};
use renderq_store::{JobStore, MemoryJobStore};

// ============================================================================
// Fakes
// ============================================================================

fn clip_for(spec: &RenderSpec) -> RenderedClip {
    RenderedClip {
        artifact_ref: format!("r2://clips/{}.mp4", spec.source.asset_id),
        payload: ResultPayload::Clip {
            duration_secs: spec.time_range.duration_secs(),
            width: 1080,
            height: 1920,
            subtitles_burned: spec.options.subtitles,
        },
    }
}

/// Succeeds immediately, counting invocations.
struct CountingRender {
    calls: AtomicU32,
}

impl CountingRender {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderPipeline for CountingRender {
    async fn execute_render(&self, spec: &RenderSpec) -> Result<RenderedClip, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(clip_for(spec))
    }
}

/// Signals `started` when an execution begins, then blocks until the test
/// adds permits to `release`.
struct BlockingRender {
    started: Arc<Semaphore>,
    release: Arc<Semaphore>,
    calls: AtomicU32,
}

impl BlockingRender {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Arc::new(Semaphore::new(0)),
            release: Arc::new(Semaphore::new(0)),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl RenderPipeline for BlockingRender {
    async fn execute_render(&self, spec: &RenderSpec) -> Result<RenderedClip, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.add_permits(1);
        let _permit = self
            .release
            .acquire()
            .await
            .map_err(|_| RenderError::transient("release semaphore closed"))?;
        Ok(clip_for(spec))
    }
}

/// Fails with a transient error for the first `fail_first` calls, then
/// succeeds.
struct FlakyRender {
    fail_first: u32,
    calls: AtomicU32,
}

impl FlakyRender {
    fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderPipeline for FlakyRender {
    async fn execute_render(&self, spec: &RenderSpec) -> Result<RenderedClip, RenderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            Err(RenderError::transient("encoder connection reset"))
        } else {
            Ok(clip_for(spec))
        }
    }
}

/// Always fails permanently.
struct BrokenSourceRender {
    calls: AtomicU32,
}

impl BrokenSourceRender {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderPipeline for BrokenSourceRender {
    async fn execute_render(&self, _spec: &RenderSpec) -> Result<RenderedClip, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RenderError::permanent("source asset is corrupt"))
    }
}

/// Denies everything.
struct DenyQuota;

#[async_trait]
impl QuotaGate for DenyQuota {
    async fn check_quota(&self, _identity: &str, _kind: WorkKind) -> QuotaDecision {
        QuotaDecision::Deny("clip render quota exhausted".to_string())
    }
}

// ============================================================================
// Harness
// ============================================================================

fn test_config() -> EngineConfig {
    EngineConfig {
        instance_id: "itest-worker".to_string(),
        max_concurrent: 2,
        max_queue_size: 4,
        heartbeat_interval: Duration::from_millis(50),
        lease_cutoff: Duration::from_secs(3600),
        reaper_interval: Duration::from_secs(3600),
        max_attempts: 3,
        render_timeout: Duration::from_secs(10),
        pickup_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(200),
    }
}

fn clip_request(asset: &str, start: f64, end: f64) -> WorkRequest {
    WorkRequest::clip(
        SourceRef::new(asset, "f1"),
        Some(TimeRange::new(start, end).unwrap()),
        ClipOptions::default(),
    )
}

fn service_with(
    config: EngineConfig,
    store: Arc<MemoryJobStore>,
    render: Arc<dyn RenderPipeline>,
) -> JobService {
    JobService::new(config, store, render, Arc::new(AllowAllQuota))
}

fn spawn_pool(service: &JobService) -> tokio::task::JoinHandle<()> {
    let pool = service.pool().clone();
    tokio::spawn(async move { pool.run().await })
}

fn poll_token(outcome: &SubmitOutcome) -> WorkKey {
    match outcome {
        SubmitOutcome::Completed { poll_token, .. } => poll_token.clone(),
        SubmitOutcome::Accepted { poll_token, .. } => poll_token.clone(),
    }
}

async fn wait_terminal(service: &JobService, token: &WorkKey) -> renderq_engine::StatusResponse {
    for _ in 0..500 {
        let status = service.get_status(token.as_str()).await.unwrap();
        if status.status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("work never reached a terminal state");
}

// ============================================================================
// Dedup and idempotence
// ============================================================================

#[tokio::test]
async fn concurrent_identical_submits_run_exactly_one_render() {
    let store = Arc::new(MemoryJobStore::new());
    let render = CountingRender::new();
    let service = Arc::new(service_with(
        test_config(),
        Arc::clone(&store),
        render.clone(),
    ));
    let _pool = spawn_pool(&service);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service
                .submit(&clip_request("abc", 10.0, 20.0), "user-1")
                .await
                .unwrap()
        }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.push(poll_token(&handle.await.unwrap()));
    }

    // Every submission resolved to the same fingerprint, with one product.
    let first = tokens[0].clone();
    assert!(tokens.iter().all(|t| *t == first));
    assert_eq!(store.product_count(), 1);

    let status = wait_terminal(&service, &first).await;
    assert_eq!(status.status, ProductStatus::Completed);
    assert_eq!(render.calls(), 1, "exactly one render execution");
}

#[tokio::test]
async fn resubmit_of_completed_key_returns_artifact_without_rerender() {
    let store = Arc::new(MemoryJobStore::new());
    let render = CountingRender::new();
    let service = service_with(test_config(), store, render.clone());
    let _pool = spawn_pool(&service);

    let request = clip_request("abc", 10.0, 20.0);
    let token = poll_token(&service.submit(&request, "user-1").await.unwrap());
    let status = wait_terminal(&service, &token).await;
    let artifact = status.artifact_ref.unwrap();

    match service.submit(&request, "user-2").await.unwrap() {
        SubmitOutcome::Completed {
            artifact_ref,
            poll_token,
        } => {
            assert_eq!(artifact_ref, artifact);
            assert_eq!(poll_token, token);
        }
        other => panic!("expected cached completion, got {other:?}"),
    }
    assert_eq!(render.calls(), 1, "cache hit must not re-render");
}

#[tokio::test]
async fn duplicate_inflight_submit_attaches_without_growing_queue() {
    let store = Arc::new(MemoryJobStore::new());
    let render = BlockingRender::new();
    let service = service_with(test_config(), Arc::clone(&store), render.clone());
    let _pool = spawn_pool(&service);

    let request = clip_request("abc", 10.0, 20.0);
    let first = poll_token(&service.submit(&request, "user-1").await.unwrap());

    // Wait until the execution is holding a slot.
    render.started.acquire().await.unwrap().forget();
    let pending_before = service.queue_stats().pending;

    let second = service.submit(&request, "user-1").await.unwrap();
    match &second {
        SubmitOutcome::Accepted { poll_token, .. } => assert_eq!(*poll_token, first),
        other => panic!("expected attach to in-flight work, got {other:?}"),
    }
    assert_eq!(service.queue_stats().pending, pending_before);
    assert_eq!(store.product_count(), 1);

    render.release.add_permits(8);
    let status = wait_terminal(&service, &first).await;
    assert_eq!(status.status, ProductStatus::Completed);
}

// ============================================================================
// Capacity
// ============================================================================

#[tokio::test]
async fn full_pending_queue_rejects_with_capacity_exceeded() {
    let store = Arc::new(MemoryJobStore::new());
    let render = BlockingRender::new();
    let service = service_with(test_config(), store, render.clone());
    let _pool = spawn_pool(&service);

    // Saturate both execution slots.
    for n in 0..2 {
        service
            .submit(&clip_request(&format!("busy-{n}"), 0.0, 5.0), "user-1")
            .await
            .unwrap();
    }
    render.started.acquire_many(2).await.unwrap().forget();

    // Fill the pending queue.
    for n in 0..4 {
        let outcome = service
            .submit(&clip_request(&format!("wait-{n}"), 0.0, 5.0), "user-1")
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Accepted { .. }));
    }

    let stats = service.queue_stats();
    assert_eq!(stats.active, 2);
    assert_eq!(stats.pending, 4);
    assert_eq!(stats.capacity, 4);

    // One more distinct key must get a clean capacity rejection.
    let overflow = service
        .submit(&clip_request("overflow", 0.0, 5.0), "user-1")
        .await;
    assert!(matches!(
        overflow,
        Err(EngineError::CapacityExceeded {
            pending: 4,
            capacity: 4
        })
    ));

    render.release.add_permits(16);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn transient_failure_requeues_and_succeeds_on_retry() {
    let store = Arc::new(MemoryJobStore::new());
    let render = FlakyRender::new(1);
    let service = service_with(test_config(), store, render.clone());
    let _pool = spawn_pool(&service);

    let token = poll_token(
        &service
            .submit(&clip_request("abc", 0.0, 5.0), "user-1")
            .await
            .unwrap(),
    );

    let status = wait_terminal(&service, &token).await;
    assert_eq!(status.status, ProductStatus::Completed);
    assert_eq!(render.calls(), 2, "one failed attempt, one successful retry");
}

#[tokio::test]
async fn permanent_failure_is_terminal_and_surfaced() {
    let store = Arc::new(MemoryJobStore::new());
    let render = BrokenSourceRender::new();
    let service = service_with(test_config(), store, render.clone());
    let _pool = spawn_pool(&service);

    let request = clip_request("abc", 0.0, 5.0);
    let token = poll_token(&service.submit(&request, "user-1").await.unwrap());

    let status = wait_terminal(&service, &token).await;
    assert_eq!(status.status, ProductStatus::Failed);
    assert_eq!(status.error.as_deref(), Some("Render failed: source asset is corrupt"));
    assert!(status.artifact_ref.is_none());
    assert_eq!(render.calls(), 1, "permanent failures must not retry");

    // A resubmit of the failed key attaches to the terminal record rather
    // than re-rendering; only a different request re-renders.
    let again = service.submit(&request, "user-1").await.unwrap();
    assert!(matches!(again, SubmitOutcome::Accepted { .. }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(render.calls(), 1);
}

#[tokio::test]
async fn attempt_budget_exhaustion_fails_terminally() {
    let store = Arc::new(MemoryJobStore::new());
    let render = FlakyRender::new(u32::MAX);
    let mut config = test_config();
    config.max_attempts = 2;
    let service = service_with(config, store, render.clone());
    let _pool = spawn_pool(&service);

    let token = poll_token(
        &service
            .submit(&clip_request("abc", 0.0, 5.0), "user-1")
            .await
            .unwrap(),
    );

    let status = wait_terminal(&service, &token).await;
    assert_eq!(status.status, ProductStatus::Failed);
    assert_eq!(render.calls(), 2, "budget of 2 attempts");
}

// ============================================================================
// Admission rejections
// ============================================================================

#[tokio::test]
async fn quota_denial_creates_no_state() {
    let store = Arc::new(MemoryJobStore::new());
    let service = JobService::new(
        test_config(),
        Arc::clone(&store) as Arc<dyn JobStore>,
        CountingRender::new(),
        Arc::new(DenyQuota),
    );

    let result = service
        .submit(&clip_request("abc", 0.0, 5.0), "user-1")
        .await;
    assert!(matches!(result, Err(EngineError::QuotaExceeded(_))));
    assert_eq!(store.product_count(), 0);
    assert_eq!(service.queue_stats().pending, 0);
}

#[tokio::test]
async fn malformed_requests_rejected_before_any_state() {
    let store = Arc::new(MemoryJobStore::new());
    let service = service_with(test_config(), Arc::clone(&store), CountingRender::new());

    let no_asset = WorkRequest::clip(
        SourceRef::new("", "f1"),
        Some(TimeRange { start_secs: 0.0, end_secs: 5.0 }),
        ClipOptions::default(),
    );
    assert!(matches!(
        service.submit(&no_asset, "user-1").await,
        Err(EngineError::Validation(_))
    ));

    let inverted = WorkRequest::clip(
        SourceRef::new("abc", "f1"),
        Some(TimeRange { start_secs: 20.0, end_secs: 10.0 }),
        ClipOptions::default(),
    );
    assert!(matches!(
        service.submit(&inverted, "user-1").await,
        Err(EngineError::Validation(_))
    ));

    assert_eq!(store.product_count(), 0);
}

#[tokio::test]
async fn poll_token_errors_are_distinguished() {
    let service = service_with(
        test_config(),
        Arc::new(MemoryJobStore::new()),
        CountingRender::new(),
    );

    assert!(matches!(
        service.get_status("not-a-key").await,
        Err(EngineError::InvalidToken(_))
    ));
    assert!(matches!(
        service.get_status(&"0".repeat(64)).await,
        Err(EngineError::UnknownToken)
    ));
}

// ============================================================================
// Reaper
// ============================================================================

#[tokio::test]
async fn stale_lease_is_reclaimed_then_completed_by_a_live_worker() {
    let store = Arc::new(MemoryJobStore::new());
    let render = CountingRender::new();
    let service = service_with(test_config(), Arc::clone(&store), render.clone());

    // Admit without a running pool, then have a "worker" claim and die:
    // processing lease, heartbeat 90 minutes old, cutoff 60 minutes.
    let token = poll_token(
        &service
            .submit(&clip_request("abc", 10.0, 20.0), "user-1")
            .await
            .unwrap(),
    );
    let mut lease = store.claim(&token, "dead-worker").await.unwrap().unwrap();
    lease.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(90));
    store.put_lease_unchecked(lease);

    let outcome = service.trigger_reaper().await.unwrap();
    assert_eq!(outcome.reclaimed, 1);

    let recovered = store.get_lease(&token).await.unwrap().unwrap();
    assert!(recovered.owner_instance_id.is_none());
    assert_eq!(recovered.attempt_count, 1);

    // A surviving instance picks the released work up and finishes it.
    let _pool = spawn_pool(&service);
    let status = wait_terminal(&service, &token).await;
    assert_eq!(status.status, ProductStatus::Completed);
    assert_eq!(render.calls(), 1);
}

#[tokio::test]
async fn repeatedly_crashing_work_exhausts_its_budget() {
    let store = Arc::new(MemoryJobStore::new());
    let mut config = test_config();
    config.max_attempts = 2;
    let service = service_with(config, Arc::clone(&store), CountingRender::new());

    let token = poll_token(
        &service
            .submit(&clip_request("abc", 10.0, 20.0), "user-1")
            .await
            .unwrap(),
    );

    // First crash: reclaim increments the attempt count.
    let mut lease = store.claim(&token, "dead-1").await.unwrap().unwrap();
    lease.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(90));
    store.put_lease_unchecked(lease);
    let first = service.trigger_reaper().await.unwrap();
    assert_eq!(first.reclaimed, 1);

    // Second crash: the budget (2) is exhausted, the product fails.
    let mut lease = store.claim(&token, "dead-2").await.unwrap().unwrap();
    lease.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(90));
    store.put_lease_unchecked(lease);
    let second = service.trigger_reaper().await.unwrap();
    assert_eq!(second.reclaimed, 0);
    assert_eq!(second.failed, 1);

    let status = service.get_status(token.as_str()).await.unwrap();
    assert_eq!(status.status, ProductStatus::Failed);
    assert!(status.error.is_some());
}

#[tokio::test]
async fn reaper_recreates_missing_lease_for_live_product() {
    let store = Arc::new(MemoryJobStore::new());
    let service = service_with(test_config(), Arc::clone(&store), CountingRender::new());

    let token = poll_token(
        &service
            .submit(&clip_request("abc", 10.0, 20.0), "user-1")
            .await
            .unwrap(),
    );
    store.remove_lease_unchecked(&token);

    let outcome = service.trigger_reaper().await.unwrap();
    assert_eq!(outcome.reconciled, 1);
    assert!(store.get_lease(&token).await.unwrap().is_some());
}

// ============================================================================
// Heartbeats and shutdown
// ============================================================================

#[tokio::test]
async fn executions_refresh_their_lease_heartbeat() {
    let store = Arc::new(MemoryJobStore::new());
    let render = BlockingRender::new();
    let service = service_with(test_config(), Arc::clone(&store), render.clone());
    let _pool = spawn_pool(&service);

    let token = poll_token(
        &service
            .submit(&clip_request("abc", 0.0, 5.0), "user-1")
            .await
            .unwrap(),
    );
    render.started.acquire().await.unwrap().forget();

    let first = store
        .get_lease(&token)
        .await
        .unwrap()
        .unwrap()
        .heartbeat_at
        .unwrap();

    // Heartbeat interval is 50ms; after a few intervals the stamp must
    // have advanced.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let later = store
        .get_lease(&token)
        .await
        .unwrap()
        .unwrap()
        .heartbeat_at
        .unwrap();
    assert!(later > first, "heartbeat must be refreshed while executing");

    render.release.add_permits(4);
}

#[tokio::test]
async fn shutdown_releases_every_owned_lease_before_exit() {
    let store = Arc::new(MemoryJobStore::new());
    let render = BlockingRender::new();
    let service = service_with(test_config(), Arc::clone(&store), render.clone());
    let _pool = spawn_pool(&service);

    let mut tokens = Vec::new();
    for n in 0..2 {
        tokens.push(poll_token(
            &service
                .submit(&clip_request(&format!("mid-{n}"), 0.0, 5.0), "user-1")
                .await
                .unwrap(),
        ));
    }
    render.started.acquire_many(2).await.unwrap().forget();

    // Executions are mid-render and will not finish within the grace
    // period; their claims must be returned to the pool regardless.
    let released = service.shutdown_coordinator().run().await.unwrap();
    assert_eq!(released, 2);

    for token in &tokens {
        let lease = store.get_lease(token).await.unwrap().unwrap();
        assert!(lease.owner_instance_id.is_none());
        assert!(lease.heartbeat_at.is_none());
        let product = store.get_product(token).await.unwrap().unwrap();
        assert_eq!(product.status, ProductStatus::Queued);
    }

    // Admissions are closed once shutdown starts.
    assert!(matches!(
        service.submit(&clip_request("late", 0.0, 5.0), "user-1").await,
        Err(EngineError::ShuttingDown)
    ));
}

// ============================================================================
// Wait estimates
// ============================================================================

#[tokio::test]
async fn queued_status_reports_position_and_wait_estimate() {
    let store = Arc::new(MemoryJobStore::new());
    let render = BlockingRender::new();
    let mut config = test_config();
    config.max_concurrent = 1;
    // Keep the pickup loop from re-adding keys mid-assertion.
    config.pickup_interval = Duration::from_secs(3600);
    let service = service_with(config, store, render.clone());
    let _pool = spawn_pool(&service);

    // Complete one render to seed the execution-time average.
    let warmup = poll_token(
        &service
            .submit(&clip_request("warmup", 0.0, 5.0), "user-1")
            .await
            .unwrap(),
    );
    render.started.acquire().await.unwrap().forget();
    render.release.add_permits(1);
    wait_terminal(&service, &warmup).await;

    // Occupy the single slot, then queue one more.
    service
        .submit(&clip_request("busy", 0.0, 5.0), "user-1")
        .await
        .unwrap();
    render.started.acquire().await.unwrap().forget();

    let queued = poll_token(
        &service
            .submit(&clip_request("waiting", 0.0, 5.0), "user-1")
            .await
            .unwrap(),
    );

    let status = service.get_status(queued.as_str()).await.unwrap();
    assert_eq!(status.status, ProductStatus::Queued);
    assert_eq!(status.queue_position, Some(1));
    let wait = status.estimated_wait_secs.expect("average is seeded");
    assert!(wait > 0.0);

    render.release.add_permits(8);
}
