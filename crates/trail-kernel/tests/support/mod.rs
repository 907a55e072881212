#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use trail_store::{
    ActivityCount, AlertEvent, AlertFiring, AlertRule, AlertStore, CaptureQueue, CapturedChange,
    ChangeFilter, ChangeRecord, ChangeSummaryRow, ChangelogStore, ExclusionRule, ExclusionSet,
    BackendKind, InMemoryTrailStore, Partition, PartitionCatalog, PartitionPeriod, PolicyStore,
    QueueDepth, QueueEntry, RetentionAction, RowSnapshot, SqliteTrailStore, StoreBundle,
    StoreError, TimeRange, TrailBackend,
};

pub fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0)
        .single()
        .expect("timestamp")
}

pub fn row(fields: &[(&str, Value)]) -> RowSnapshot {
    fields
        .iter()
        .map(|(field, value)| (field.to_string(), value.clone()))
        .collect()
}

pub fn customer(id: i64, name: &str, status: &str) -> RowSnapshot {
    row(&[("id", json!(id)), ("name", json!(name)), ("status", json!(status))])
}

/// Every backend the kernel is exercised against, each freshly created.
pub fn backends() -> Vec<(&'static str, Arc<dyn TrailBackend>)> {
    let sqlite = SqliteTrailStore::open(":memory:").expect("sqlite");
    sqlite.ensure_schema().expect("schema");
    vec![
        ("memory", InMemoryTrailStore::shared()),
        ("sqlite", Arc::new(sqlite)),
    ]
}

pub fn bundles() -> Vec<(&'static str, StoreBundle)> {
    backends()
        .into_iter()
        .map(|(name, backend)| {
            let kind = match name {
                "sqlite" => BackendKind::Sqlite {
                    path: ":memory:".to_string(),
                    archive_path: ":memory:".to_string(),
                },
                _ => BackendKind::Memory,
            };
            (name, StoreBundle::new(kind, backend))
        })
        .collect()
}

/// In-memory backend with switchable faults.
#[derive(Default)]
pub struct FlakyBackend {
    pub inner: InMemoryTrailStore,
    /// Remaining retire calls that fail before the store is reached.
    pub retire_failures: AtomicU32,
    pub retire_calls: AtomicU32,
    pub fail_top_tenant: AtomicBool,
    pub fail_promote: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Claims drive a private runtime, the way a blocking database client does.
    pub claim_on_own_runtime: AtomicBool,
    pub claim_calls: AtomicU32,
}

impl FlakyBackend {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_retire(&self, times: u32) {
        self.retire_failures.store(times, Ordering::SeqCst);
    }
}

impl ChangelogStore for FlakyBackend {
    fn next_transaction_id(&self) -> Result<u64, StoreError> {
        self.inner.next_transaction_id()
    }

    fn append(&self, changes: Vec<CapturedChange>) -> Result<Vec<ChangeRecord>, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Store("change log unavailable".to_string()));
        }
        self.inner.append(changes)
    }

    fn history(
        &self,
        entity: &str,
        row_id: &str,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        self.inner.history(entity, row_id, limit)
    }

    fn changes_after(
        &self,
        entity: &str,
        row_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        self.inner.changes_after(entity, row_id, after)
    }

    fn by_actor(
        &self,
        actor_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        self.inner.by_actor(actor_id, range, limit)
    }

    fn by_tenant(
        &self,
        tenant_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        self.inner.by_tenant(tenant_id, range, limit)
    }

    fn by_transaction(&self, transaction_id: u64) -> Result<Vec<ChangeRecord>, StoreError> {
        self.inner.by_transaction(transaction_id)
    }

    fn summary(&self, range: TimeRange) -> Result<Vec<ChangeSummaryRow>, StoreError> {
        self.inner.summary(range)
    }

    fn count(&self, range: TimeRange, filter: &ChangeFilter) -> Result<u64, StoreError> {
        self.inner.count(range, filter)
    }

    fn top_actor(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError> {
        self.inner.top_actor(range)
    }

    fn top_tenant(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError> {
        if self.fail_top_tenant.load(Ordering::SeqCst) {
            return Err(StoreError::Store("tenant aggregate unavailable".to_string()));
        }
        self.inner.top_tenant(range)
    }
}

impl CaptureQueue for FlakyBackend {
    fn enqueue(
        &self,
        changes: Vec<CapturedChange>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Vec<u64>, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Store("capture queue unavailable".to_string()));
        }
        self.inner.enqueue(changes, enqueued_at)
    }

    fn claim(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if self.claim_on_own_runtime.load(Ordering::SeqCst) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .map_err(|err| StoreError::Store(err.to_string()))?;
            return runtime.block_on(async { self.inner.claim(owner, limit, now, lease) });
        }
        self.inner.claim(owner, limit, now, lease)
    }

    fn promote(&self, owner: &str, entry_ids: &[u64]) -> Result<Vec<ChangeRecord>, StoreError> {
        if self.fail_promote.load(Ordering::SeqCst) {
            return Err(StoreError::Store("change log unavailable".to_string()));
        }
        self.inner.promote(owner, entry_ids)
    }

    fn release(&self, owner: &str, entry_ids: &[u64]) -> Result<usize, StoreError> {
        self.inner.release(owner, entry_ids)
    }

    fn depth(&self, now: DateTime<Utc>) -> Result<QueueDepth, StoreError> {
        self.inner.depth(now)
    }

    fn queued_for_row(&self, entity: &str, row_id: &str) -> Result<u64, StoreError> {
        self.inner.queued_for_row(entity, row_id)
    }
}

impl PartitionCatalog for FlakyBackend {
    fn create_partition(
        &self,
        period: PartitionPeriod,
        at: DateTime<Utc>,
    ) -> Result<Partition, StoreError> {
        self.inner.create_partition(period, at)
    }

    fn list_partitions(&self) -> Result<Vec<Partition>, StoreError> {
        self.inner.list_partitions()
    }

    fn retire_partition(
        &self,
        name: &str,
        action: RetentionAction,
        at: DateTime<Utc>,
    ) -> Result<Partition, StoreError> {
        self.retire_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.retire_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.retire_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Store("archive namespace busy".to_string()));
        }
        self.inner.retire_partition(name, action, at)
    }

    fn read_archived(&self, name: &str) -> Result<Vec<ChangeRecord>, StoreError> {
        self.inner.read_archived(name)
    }
}

impl AlertStore for FlakyBackend {
    fn put_rule(&self, rule: AlertRule) -> Result<(), StoreError> {
        self.inner.put_rule(rule)
    }

    fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        self.inner.set_rule_enabled(name, enabled)
    }

    fn list_rules(&self) -> Result<Vec<AlertRule>, StoreError> {
        self.inner.list_rules()
    }

    fn fire_if_cooled(&self, firing: AlertFiring) -> Result<Option<AlertEvent>, StoreError> {
        self.inner.fire_if_cooled(firing)
    }

    fn events(&self, range: TimeRange) -> Result<Vec<AlertEvent>, StoreError> {
        self.inner.events(range)
    }

    fn acknowledge(
        &self,
        event_id: u64,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<AlertEvent, StoreError> {
        self.inner.acknowledge(event_id, by, at)
    }
}

impl PolicyStore for FlakyBackend {
    fn capture_enabled(&self, entity: &str) -> Result<bool, StoreError> {
        self.inner.capture_enabled(entity)
    }

    fn set_capture_enabled(&self, entity: &str, enabled: bool) -> Result<(), StoreError> {
        self.inner.set_capture_enabled(entity, enabled)
    }

    fn enabled_entities(&self) -> Result<Vec<String>, StoreError> {
        self.inner.enabled_entities()
    }

    fn entity_exclusions(&self, entity: &str) -> Result<ExclusionSet, StoreError> {
        self.inner.entity_exclusions(entity)
    }

    fn put_exclusion(&self, rule: ExclusionRule) -> Result<(), StoreError> {
        self.inner.put_exclusion(rule)
    }

    fn delete_exclusion(&self, entity: &str, field: &str) -> Result<bool, StoreError> {
        self.inner.delete_exclusion(entity, field)
    }

    fn exclusion_rules(&self) -> Result<Vec<ExclusionRule>, StoreError> {
        self.inner.exclusion_rules()
    }
}
