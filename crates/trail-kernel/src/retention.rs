use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use trail_store::{
    Clock, Partition, PartitionPeriod, PartitionState, RetentionAction, StoreError, TrailBackend,
};

#[derive(Clone, Debug)]
pub struct RetentionConfig {
    pub period: PartitionPeriod,
    /// Future partitions kept ready beyond the current one.
    pub ahead: u32,
    pub horizon: Duration,
    pub action: RetentionAction,
    pub max_attempts: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            period: PartitionPeriod::Monthly,
            ahead: 2,
            horizon: Duration::days(365),
            action: RetentionAction::Archive,
            max_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub ensured: Vec<Partition>,
    pub retired: Vec<Partition>,
    /// Partition name and last error for everything left for the next cycle.
    pub failures: Vec<(String, String)>,
}

/// Keeps partitions ready ahead of time and retires the ones past the horizon.
#[derive(Clone)]
pub struct PartitionManager {
    config: RetentionConfig,
    backend: Arc<dyn TrailBackend>,
    clock: Arc<dyn Clock>,
}

impl PartitionManager {
    pub fn new(config: RetentionConfig, backend: Arc<dyn TrailBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            backend,
            clock,
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub fn run_maintenance(&self) -> Result<MaintenanceReport, StoreError> {
        self.run_at(self.clock.now())
    }

    pub fn run_at(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, StoreError> {
        let mut report = MaintenanceReport::default();
        let mut range = self.config.period.bounds_containing(now);
        for _ in 0..=self.config.ahead {
            let name = self.config.period.partition_name(&range);
            match self.with_retries(&name, || {
                self.backend.create_partition(self.config.period, range.start)
            }) {
                Ok(partition) => report.ensured.push(partition),
                Err(err) => report.failures.push((name, err.to_string())),
            }
            range = self.config.period.following(&range);
        }

        let cutoff = now - self.config.horizon;
        let retired = self.retire_before(cutoff, self.config.action, now)?;
        report.retired = retired.retired;
        report.failures.extend(retired.failures);
        Ok(report)
    }

    /// Retires every active partition that ends at or before `cutoff`. Each
    /// partition moves as one step; failures leave it in place.
    pub fn retire_before(
        &self,
        cutoff: DateTime<Utc>,
        action: RetentionAction,
        now: DateTime<Utc>,
    ) -> Result<MaintenanceReport, StoreError> {
        let mut report = MaintenanceReport::default();
        let expired: Vec<Partition> = self
            .backend
            .list_partitions()?
            .into_iter()
            .filter(|partition| {
                partition.state == PartitionState::Active
                    && !partition.is_default()
                    && partition.ends_before(cutoff)
            })
            .collect();
        for partition in expired {
            match self.with_retries(&partition.name, || {
                self.backend.retire_partition(&partition.name, action, now)
            }) {
                Ok(retired) => {
                    info!(
                        partition = %retired.name,
                        state = retired.state.as_str(),
                        records = retired.record_count,
                        "partition retired"
                    );
                    report.retired.push(retired);
                }
                Err(err) => report.failures.push((partition.name, err.to_string())),
            }
        }
        Ok(report)
    }

    fn with_retries<T>(
        &self,
        partition: &str,
        mut attempt: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt() {
                Ok(value) => return Ok(value),
                Err(err) if tries < max_attempts && retryable(&err) => {
                    warn!(partition = %partition, attempt = tries, error = %err, "partition step failed, retrying");
                }
                Err(err) => {
                    warn!(partition = %partition, attempt = tries, error = %err, "partition step failed");
                    return Err(err);
                }
            }
        }
    }
}

fn retryable(err: &StoreError) -> bool {
    matches!(err, StoreError::Store(_))
}
