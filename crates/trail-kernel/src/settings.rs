use std::time::Duration as StdDuration;

use chrono::Duration;
use trail_store::{ConfigError, PartitionPeriod, RetentionAction, SystemConfig};

use crate::capture::{CaptureConfig, CaptureMode};
use crate::retention::RetentionConfig;
use crate::worker::WorkerConfig;

/// Kernel settings resolved from the validated system config.
#[derive(Clone, Debug)]
pub struct TrailSettings {
    pub capture: CaptureConfig,
    pub worker: WorkerConfig,
    pub retention: RetentionConfig,
    pub worker_interval: StdDuration,
    pub alert_interval: StdDuration,
    pub partition_interval: StdDuration,
}

impl Default for TrailSettings {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            worker: WorkerConfig::default(),
            retention: RetentionConfig::default(),
            worker_interval: StdDuration::from_millis(1_000),
            alert_interval: StdDuration::from_millis(60_000),
            partition_interval: StdDuration::from_millis(3_600_000),
        }
    }
}

impl TrailSettings {
    pub fn from_config(config: &SystemConfig) -> Result<Self, ConfigError> {
        let capture = CaptureConfig {
            mode: parse_key::<CaptureMode>(config, "capture.mode")?,
            strict: config.get_bool("capture.strict"),
        };
        let worker = WorkerConfig {
            batch_size: config.get_unsigned("worker.batch_size").max(1) as usize,
            lease: Duration::milliseconds(config.get_unsigned("worker.lease_ms") as i64),
        };
        let retention = RetentionConfig {
            period: parse_key::<PartitionPeriod>(config, "partitions.period")?,
            ahead: config.get_unsigned("partitions.ahead") as u32,
            horizon: Duration::days(config.get_unsigned("retention.horizon_days") as i64),
            action: parse_key::<RetentionAction>(config, "retention.action")?,
            max_attempts: config.get_unsigned("retention.max_attempts").max(1) as u32,
        };
        Ok(Self {
            capture,
            worker,
            retention,
            worker_interval: interval(config, "worker.interval_ms"),
            alert_interval: interval(config, "alerts.interval_ms"),
            partition_interval: interval(config, "partitions.interval_ms"),
        })
    }
}

fn parse_key<T>(config: &SystemConfig, key: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = String>,
{
    config
        .get_string(key)
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue(key.to_string(), err))
}

fn interval(config: &SystemConfig, key: &str) -> StdDuration {
    StdDuration::from_millis(config.get_unsigned(key).max(1))
}
