mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use support::{at, customer, FlakyBackend};
use trail_kernel::{PartitionManager, RetentionConfig};
use trail_store::{
    CaptureContext, CapturedChange, ChangelogStore, InMemoryTrailStore, ManualClock, Operation,
    PartitionCatalog, PartitionPeriod, PartitionState, RetentionAction, SqliteTrailStore,
    StoreError, TrailBackend,
};

fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 12, 0, 0)
        .single()
        .expect("timestamp")
}

fn config(action: RetentionAction) -> RetentionConfig {
    RetentionConfig {
        period: PartitionPeriod::Monthly,
        ahead: 2,
        horizon: Duration::days(365),
        action,
        max_attempts: 3,
    }
}

fn old_insert(row_id: &str, captured_at: DateTime<Utc>) -> CapturedChange {
    CapturedChange {
        entity: "customers".to_string(),
        operation: Operation::Insert,
        row_id: row_id.to_string(),
        old_snapshot: None,
        new_snapshot: Some(customer(1, "Alice", "new")),
        changed_fields: Default::default(),
        redacted_fields: Default::default(),
        captured_at,
        context: CaptureContext::for_actor("alice"),
        transaction_id: 1,
        sequence: 0,
    }
}

fn backends() -> Vec<(&'static str, Arc<dyn TrailBackend>)> {
    let sqlite = SqliteTrailStore::open(":memory:").expect("sqlite");
    sqlite.ensure_schema().expect("schema");
    vec![
        ("memory", InMemoryTrailStore::shared()),
        ("sqlite", Arc::new(sqlite)),
    ]
}

#[test]
fn maintenance_keeps_current_and_future_partitions_ready() {
    for (name, backend) in backends() {
        let clock = ManualClock::shared(at(10, 9, 0));
        let manager = PartitionManager::new(config(RetentionAction::Archive), backend.clone(), clock);

        let report = manager.run_maintenance().expect("maintenance");
        let ensured: Vec<&str> = report.ensured.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            ensured,
            vec![
                "change_records_p202403",
                "change_records_p202404",
                "change_records_p202405"
            ],
            "{name}"
        );
        assert!(report.failures.is_empty(), "{name}");

        let again = manager.run_maintenance().expect("second run");
        assert_eq!(again.ensured.len(), 3, "{name}");
        let active = backend
            .list_partitions()
            .expect("list")
            .into_iter()
            .filter(|p| p.state == PartitionState::Active && !p.is_default())
            .count();
        assert_eq!(active, 3, "{name}");
    }
}

#[test]
fn partitions_past_the_horizon_are_archived_with_their_records() {
    for (name, backend) in backends() {
        backend
            .create_partition(PartitionPeriod::Monthly, date(2023, 1, 15))
            .expect("old partition");
        backend
            .append(vec![old_insert("1", date(2023, 1, 20))])
            .expect("old record");
        let clock = ManualClock::shared(date(2024, 3, 10));
        let manager = PartitionManager::new(config(RetentionAction::Archive), backend.clone(), clock);

        let report = manager.run_maintenance().expect("maintenance");
        assert_eq!(report.retired.len(), 1, "{name}");
        let retired = &report.retired[0];
        assert_eq!(retired.name, "change_records_p202301", "{name}");
        assert_eq!(retired.state, PartitionState::Archived, "{name}");
        assert_eq!(retired.record_count, 1, "{name}");

        assert!(backend.history("customers", "1", 0).expect("history").is_empty());
        let archived = backend
            .read_archived("change_records_p202301")
            .expect("archived records");
        assert_eq!(archived.len(), 1, "{name}");
        assert_eq!(archived[0].row_id, "1");
    }
}

#[test]
fn dropped_partitions_leave_a_tombstone() {
    let backend: Arc<dyn TrailBackend> = InMemoryTrailStore::shared();
    backend
        .create_partition(PartitionPeriod::Monthly, date(2022, 6, 1))
        .expect("old partition");
    let clock = ManualClock::shared(date(2024, 3, 10));
    let manager = PartitionManager::new(config(RetentionAction::Drop), backend.clone(), clock);

    let report = manager.run_maintenance().expect("maintenance");
    assert_eq!(report.retired[0].state, PartitionState::Dropped);
    let listed = backend.list_partitions().expect("list");
    assert!(listed
        .iter()
        .any(|p| p.name == "change_records_p202206" && p.state == PartitionState::Dropped));
    assert!(matches!(
        backend.read_archived("change_records_p202206"),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn transient_retire_failures_are_retried_within_the_cycle() {
    let backend = FlakyBackend::shared();
    backend
        .create_partition(PartitionPeriod::Monthly, date(2023, 1, 15))
        .expect("old partition");
    backend.fail_retire(2);
    let clock = ManualClock::shared(date(2024, 3, 10));
    let manager = PartitionManager::new(config(RetentionAction::Archive), backend.clone(), clock);

    let report = manager.run_maintenance().expect("maintenance");
    assert_eq!(report.retired.len(), 1);
    assert!(report.failures.is_empty());
    assert_eq!(backend.retire_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn exhausted_retries_leave_the_partition_for_the_next_cycle() {
    let backend = FlakyBackend::shared();
    backend
        .create_partition(PartitionPeriod::Monthly, date(2023, 1, 15))
        .expect("old partition");
    backend.fail_retire(3);
    let clock = ManualClock::shared(date(2024, 3, 10));
    let manager = PartitionManager::new(config(RetentionAction::Archive), backend.clone(), clock);

    let first = manager.run_maintenance().expect("first cycle");
    assert!(first.retired.is_empty());
    assert_eq!(first.failures.len(), 1);
    assert_eq!(first.failures[0].0, "change_records_p202301");
    let still_active = backend
        .list_partitions()
        .expect("list")
        .into_iter()
        .any(|p| p.name == "change_records_p202301" && p.state == PartitionState::Active);
    assert!(still_active);

    let second = manager.run_maintenance().expect("second cycle");
    assert_eq!(second.retired.len(), 1);
    assert!(second.failures.is_empty());
}
