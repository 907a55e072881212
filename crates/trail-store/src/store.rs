use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::alert::{AlertEvent, AlertFiring, AlertRule};
use crate::model::{
    ActivityCount, CapturedChange, ChangeFilter, ChangeRecord, ChangeSummaryRow, QueueDepth,
    QueueEntry, TimeRange,
};
use crate::partition::{Partition, PartitionPeriod, RetentionAction};
use crate::policy::{ExclusionRule, ExclusionSet};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// The append-only change log.
pub trait ChangelogStore: Send + Sync {
    /// Allocates a transaction id for a new capture unit of work.
    fn next_transaction_id(&self) -> Result<u64, StoreError>;

    /// Appends all changes or none. Ids are assigned in commit order.
    fn append(&self, changes: Vec<CapturedChange>) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Newest first.
    fn history(&self, entity: &str, row_id: &str, limit: usize)
        -> Result<Vec<ChangeRecord>, StoreError>;

    /// Records captured strictly after `after`, newest first by
    /// `(captured_at, transaction_id, sequence)`.
    fn changes_after(
        &self,
        entity: &str,
        row_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, StoreError>;

    fn by_actor(&self, actor_id: &str, range: TimeRange, limit: usize)
        -> Result<Vec<ChangeRecord>, StoreError>;

    fn by_tenant(&self, tenant_id: &str, range: TimeRange, limit: usize)
        -> Result<Vec<ChangeRecord>, StoreError>;

    /// Ordered by sequence.
    fn by_transaction(&self, transaction_id: u64) -> Result<Vec<ChangeRecord>, StoreError>;

    fn summary(&self, range: TimeRange) -> Result<Vec<ChangeSummaryRow>, StoreError>;

    fn count(&self, range: TimeRange, filter: &ChangeFilter) -> Result<u64, StoreError>;

    fn top_actor(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError>;

    fn top_tenant(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError>;
}

/// Pending captures waiting for a worker.
pub trait CaptureQueue: Send + Sync {
    fn enqueue(
        &self,
        changes: Vec<CapturedChange>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Vec<u64>, StoreError>;

    /// Claims up to `limit` entries that are unclaimed or whose lease has
    /// expired. Claimed entries are invisible to other owners until released
    /// or expired.
    fn claim(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    /// Removes the entries still claimed by `owner` and appends them to the
    /// change log, in one atomic step. Entries whose claim was lost are skipped.
    fn promote(&self, owner: &str, entry_ids: &[u64]) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Makes claimed entries immediately claimable again.
    fn release(&self, owner: &str, entry_ids: &[u64]) -> Result<usize, StoreError>;

    fn depth(&self, now: DateTime<Utc>) -> Result<QueueDepth, StoreError>;

    /// Entries for one row not yet promoted into the change log, claimed or not.
    fn queued_for_row(&self, entity: &str, row_id: &str) -> Result<u64, StoreError>;
}

pub trait PartitionCatalog: Send + Sync {
    /// Creates the partition of `period` containing `at`. Idempotent; moves any
    /// matching records out of the default partition.
    fn create_partition(
        &self,
        period: PartitionPeriod,
        at: DateTime<Utc>,
    ) -> Result<Partition, StoreError>;

    /// All partitions including the default one and retired ones.
    fn list_partitions(&self) -> Result<Vec<Partition>, StoreError>;

    /// Archives or drops one partition as a single atomic step.
    fn retire_partition(
        &self,
        name: &str,
        action: RetentionAction,
        at: DateTime<Utc>,
    ) -> Result<Partition, StoreError>;

    /// Reads an archived partition from the cold namespace.
    fn read_archived(&self, name: &str) -> Result<Vec<ChangeRecord>, StoreError>;
}

pub trait AlertStore: Send + Sync {
    /// Inserts or replaces the rule with this name.
    fn put_rule(&self, rule: AlertRule) -> Result<(), StoreError>;

    fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError>;

    fn list_rules(&self) -> Result<Vec<AlertRule>, StoreError>;

    /// Records the firing unless the rule already fired within its cooldown.
    /// The check and the insert are one atomic step.
    fn fire_if_cooled(&self, firing: AlertFiring) -> Result<Option<AlertEvent>, StoreError>;

    fn events(&self, range: TimeRange) -> Result<Vec<AlertEvent>, StoreError>;

    fn acknowledge(
        &self,
        event_id: u64,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<AlertEvent, StoreError>;
}

/// Durable capture enablement and redaction registry, shared by every
/// process that captures into or reads from the same backend.
pub trait PolicyStore: Send + Sync {
    fn capture_enabled(&self, entity: &str) -> Result<bool, StoreError>;

    fn set_capture_enabled(&self, entity: &str, enabled: bool) -> Result<(), StoreError>;

    /// Sorted by name.
    fn enabled_entities(&self) -> Result<Vec<String>, StoreError>;

    fn entity_exclusions(&self, entity: &str) -> Result<ExclusionSet, StoreError>;

    /// Inserts or replaces the exclusion of `(entity, field)`.
    fn put_exclusion(&self, rule: ExclusionRule) -> Result<(), StoreError>;

    /// False when no such exclusion existed.
    fn delete_exclusion(&self, entity: &str, field: &str) -> Result<bool, StoreError>;

    /// Sorted by entity, then field.
    fn exclusion_rules(&self) -> Result<Vec<ExclusionRule>, StoreError>;
}

/// Everything the trail needs from one backend. Queue promotion and cooldown
/// checks rely on the queue, log and alert tables living in the same store.
pub trait TrailBackend:
    ChangelogStore + CaptureQueue + PartitionCatalog + AlertStore + PolicyStore
{
}

impl<T> TrailBackend for T where
    T: ChangelogStore + CaptureQueue + PartitionCatalog + AlertStore + PolicyStore
{
}

pub(crate) fn apply_limit(records: &mut Vec<ChangeRecord>, limit: usize) {
    if limit > 0 && records.len() > limit {
        records.truncate(limit);
    }
}
