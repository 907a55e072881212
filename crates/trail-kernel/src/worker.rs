use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};
use trail_store::{Clock, QueueDepth, StoreError, TrailBackend};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lease: Duration::seconds(30),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub claimed: usize,
    pub promoted: usize,
    /// Claimed entries another worker took over before promotion.
    pub lost: usize,
    pub depth: QueueDepth,
}

/// Drains the capture queue into the change log. Any number of workers may
/// share one queue; claims keep them from promoting the same entry twice.
#[derive(Clone)]
pub struct CaptureWorker {
    id: String,
    config: WorkerConfig,
    backend: Arc<dyn TrailBackend>,
    clock: Arc<dyn Clock>,
}

impl CaptureWorker {
    pub fn new(config: WorkerConfig, backend: Arc<dyn TrailBackend>, clock: Arc<dyn Clock>) -> Self {
        Self::with_id(format!("worker-{}", Uuid::new_v4()), config, backend, clock)
    }

    pub fn with_id(
        id: impl Into<String>,
        config: WorkerConfig,
        backend: Arc<dyn TrailBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            backend,
            clock,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claims one batch and promotes it.
    pub fn run_once(&self) -> Result<WorkerReport, StoreError> {
        let now = self.clock.now();
        let entries = self
            .backend
            .claim(&self.id, self.config.batch_size.max(1), now, self.config.lease)?;
        let mut report = WorkerReport {
            claimed: entries.len(),
            ..WorkerReport::default()
        };
        if !entries.is_empty() {
            let ids: Vec<u64> = entries.iter().map(|entry| entry.id).collect();
            match self.backend.promote(&self.id, &ids) {
                Ok(records) => {
                    report.promoted = records.len();
                    report.lost = ids.len() - records.len();
                }
                Err(err) => {
                    warn!(worker = %self.id, error = %err, claimed = ids.len(), "promotion failed, releasing claims");
                    if let Err(release_err) = self.backend.release(&self.id, &ids) {
                        warn!(worker = %self.id, error = %release_err, "releasing claims failed");
                    }
                    return Err(err);
                }
            }
        }
        report.depth = self.backend.depth(self.clock.now())?;
        if report.promoted > 0 || report.lost > 0 {
            info!(
                worker = %self.id,
                promoted = report.promoted,
                lost = report.lost,
                pending = report.depth.pending,
                "capture queue drained"
            );
        } else {
            debug!(worker = %self.id, pending = report.depth.pending, "capture queue idle");
        }
        Ok(report)
    }

    /// Runs cycles until a cycle claims nothing.
    pub fn drain(&self) -> Result<usize, StoreError> {
        let mut promoted = 0;
        loop {
            let report = self.run_once()?;
            promoted += report.promoted;
            if report.claimed == 0 {
                return Ok(promoted);
            }
        }
    }
}
