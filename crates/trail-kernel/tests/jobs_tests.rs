mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use support::{at, customer, FlakyBackend};
use tokio::sync::watch;
use trail_kernel::{
    spawn_periodic, BackgroundJob, CaptureConfig, CaptureInterceptor, CaptureMode, CaptureWorker,
    Mutation, WorkerConfig,
};
use trail_store::{
    CaptureContext, CapturePolicy, ChangelogStore, Clock, InMemoryCapturePolicy,
    InMemoryTrailStore, ManualClock, StoreError, TrailBackend,
};

#[derive(Default)]
struct CountingJob {
    cycles: AtomicUsize,
}

#[async_trait]
impl BackgroundJob for CountingJob {
    fn name(&self) -> &str {
        "counting"
    }

    async fn run_cycle(&self) -> Result<(), StoreError> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
        if cycle % 2 == 1 {
            return Err(StoreError::Store("odd cycle".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn periodic_job_survives_errors_and_stops_on_shutdown() {
    let job = Arc::new(CountingJob::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = spawn_periodic(job.clone(), Duration::from_millis(5), shutdown_rx);

    tokio::time::sleep(Duration::from_millis(60)).await;
    shutdown_tx.send(true).expect("signal shutdown");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("job stops")
        .expect("job task");

    let cycles = job.cycles.load(Ordering::SeqCst);
    assert!(cycles >= 3, "only {cycles} cycles ran");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(job.cycles.load(Ordering::SeqCst), cycles);
}

#[tokio::test]
async fn dropping_the_shutdown_sender_stops_the_job() {
    let job = Arc::new(CountingJob::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = spawn_periodic(job, Duration::from_millis(5), shutdown_rx);
    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("job stops")
        .expect("job task");
}

#[tokio::test]
async fn capture_worker_job_drains_the_queue() {
    let backend: Arc<dyn TrailBackend> = InMemoryTrailStore::shared();
    let policy = InMemoryCapturePolicy::shared();
    policy.enable_capture("customers");
    let clock = ManualClock::shared(at(10, 9, 0));
    let interceptor = CaptureInterceptor::new(
        CaptureConfig {
            mode: CaptureMode::Async,
            strict: true,
        },
        policy,
        backend.clone(),
        clock.clone(),
    );
    for row in 0..5 {
        interceptor
            .capture_one(
                CaptureContext::for_actor("alice"),
                &Mutation::insert("customers", row.to_string(), customer(row, "Alice", "new")),
            )
            .expect("capture");
    }

    let worker = CaptureWorker::new(
        WorkerConfig {
            batch_size: 2,
            ..WorkerConfig::default()
        },
        backend.clone(),
        clock.clone(),
    );
    assert_eq!(worker.name(), "capture-worker");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = spawn_periodic(Arc::new(worker), Duration::from_millis(5), shutdown_rx);

    let mut drained = false;
    for _ in 0..200 {
        if backend.depth(clock.now()).expect("depth").total() == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown_tx.send(true).expect("signal shutdown");
    handle.await.expect("job task");

    assert!(drained);
    for row in 0..5 {
        let history = backend
            .history("customers", &row.to_string(), 0)
            .expect("history");
        assert_eq!(history.len(), 1);
    }
}

#[tokio::test]
async fn worker_cycles_may_block_on_a_client_runtime() {
    let flaky = FlakyBackend::shared();
    flaky.claim_on_own_runtime.store(true, Ordering::SeqCst);
    let backend: Arc<dyn TrailBackend> = flaky.clone();
    let policy = InMemoryCapturePolicy::shared();
    policy.enable_capture("customers");
    let clock = ManualClock::shared(at(10, 9, 0));
    let interceptor = CaptureInterceptor::new(
        CaptureConfig {
            mode: CaptureMode::Async,
            strict: true,
        },
        policy,
        backend.clone(),
        clock.clone(),
    );
    interceptor
        .capture_one(
            CaptureContext::for_actor("alice"),
            &Mutation::insert("customers", "1", customer(1, "Alice", "new")),
        )
        .expect("capture");

    let worker = CaptureWorker::new(WorkerConfig::default(), backend.clone(), clock.clone());
    worker.run_cycle().await.expect("cycle on the blocking pool");

    assert_eq!(flaky.claim_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.depth(clock.now()).expect("depth").total(), 0);
    assert_eq!(backend.history("customers", "1", 0).expect("history").len(), 1);
}
