mod alerting;
mod capture;
mod diff;
mod jobs;
mod primary;
mod reconstruct;
mod retention;
mod settings;
mod trail;
mod worker;

pub use alerting::{AlertEvaluator, EvaluationReport, Observation, RuleFailure};
pub use capture::{
    CaptureConfig, CaptureError, CaptureInterceptor, CaptureMode, CaptureOutcome,
    CaptureTransaction, CommitReceipt, Mutation, SkipReason,
};
pub use diff::{changed_fields, compute_diff, is_distinct, mask_record, redact, DiffOutcome};
pub use jobs::{spawn_periodic, BackgroundJob};
pub use primary::{InMemoryPrimaryStore, PrimaryError, RowWrite};
pub use reconstruct::{
    HistoricalState, LatestRecordState, PrimaryStore, ReconstructionEngine, ReconstructionError,
};
pub use retention::{MaintenanceReport, PartitionManager, RetentionConfig};
pub use settings::TrailSettings;
pub use trail::{Trail, TrailError};
pub use worker::{CaptureWorker, WorkerConfig, WorkerReport};
