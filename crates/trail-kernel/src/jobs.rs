use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use trail_store::StoreError;

use crate::alerting::AlertEvaluator;
use crate::retention::PartitionManager;
use crate::worker::CaptureWorker;

/// One unit of periodic background work.
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    fn name(&self) -> &str;
    async fn run_cycle(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl BackgroundJob for CaptureWorker {
    fn name(&self) -> &str {
        "capture-worker"
    }

    async fn run_cycle(&self) -> Result<(), StoreError> {
        let worker = self.clone();
        on_blocking_pool(move || worker.run_once().map(|_| ())).await
    }
}

#[async_trait]
impl BackgroundJob for AlertEvaluator {
    fn name(&self) -> &str {
        "alert-evaluator"
    }

    async fn run_cycle(&self) -> Result<(), StoreError> {
        let evaluator = self.clone();
        let report = on_blocking_pool(move || evaluator.evaluate()).await?;
        if !report.fired.is_empty() {
            info!(fired = report.fired.len(), evaluated = report.evaluated, "alert cycle finished");
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundJob for PartitionManager {
    fn name(&self) -> &str {
        "partition-manager"
    }

    async fn run_cycle(&self) -> Result<(), StoreError> {
        let manager = self.clone();
        let report = on_blocking_pool(move || manager.run_maintenance()).await?;
        for (partition, error) in &report.failures {
            warn!(partition = %partition, error = %error, "partition left for the next cycle");
        }
        Ok(())
    }
}

/// Backends are synchronous and the Postgres client blocks on its own
/// runtime, so store work never runs on an async worker thread.
async fn on_blocking_pool<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StoreError::Store(format!("background cycle aborted: {err}")))?
}

/// Runs `job` every `period` until `shutdown` flips to true. Cycle errors are
/// logged and the loop keeps going.
pub fn spawn_periodic(
    job: Arc<dyn BackgroundJob>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(job = %job.name(), period_ms = period.as_millis() as u64, "background job started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = job.run_cycle().await {
                        warn!(job = %job.name(), error = %err, "background job cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(job = %job.name(), "shutdown sender dropped");
                        break;
                    }
                }
            }
        }
        info!(job = %job.name(), "background job stopped");
    })
}
