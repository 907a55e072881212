pub mod alert;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod context;
pub mod memory;
pub mod model;
pub mod partition;
pub mod pg_store;
pub mod policy;
pub mod sqlite_store;
pub mod static_config;
pub mod store;

pub use alert::{
    within_cooldown, AlertEvent, AlertFiring, AlertMetric, AlertRule, Comparator, Severity,
};
pub use bootstrap::{load_from_system_config, resolve_backend_kind, BackendKind, StoreBundle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SystemConfig, SystemConfigLoader};
pub use context::{CaptureContext, ContextProvider};
pub use memory::InMemoryTrailStore;
pub use model::{
    sort_newest_first, ActivityCount, CapturedChange, ChangeFilter, ChangeRecord,
    ChangeSummaryRow, Operation, QueueClaim, QueueDepth, QueueEntry, RowSnapshot, TimeRange,
};
pub use partition::{
    Partition, PartitionPeriod, PartitionState, RetentionAction, DEFAULT_PARTITION,
};
pub use pg_store::PgTrailStore;
pub use policy::{
    CapturePolicy, ExclusionRule, ExclusionSet, InMemoryCapturePolicy, PolicySnapshot,
    StoredCapturePolicy,
};
pub use sqlite_store::SqliteTrailStore;
pub use store::{
    AlertStore, CaptureQueue, ChangelogStore, PartitionCatalog, PolicyStore, StoreError,
    TrailBackend,
};
