use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use trail_store::{
    AlertFiring, AlertMetric, AlertRule, CaptureContext, CapturedChange, ChangeFilter,
    Comparator, ExclusionRule, InMemoryTrailStore, Operation, PartitionPeriod, PartitionState,
    PolicyStore, RetentionAction, RowSnapshot, Severity, SqliteTrailStore, StoreError, TimeRange,
    TrailBackend, DEFAULT_PARTITION,
};

fn backends() -> Vec<(&'static str, Arc<dyn TrailBackend>)> {
    let sqlite = SqliteTrailStore::open(":memory:").expect("sqlite");
    sqlite.ensure_schema().expect("schema");
    vec![
        ("memory", InMemoryTrailStore::shared()),
        ("sqlite", Arc::new(sqlite)),
    ]
}

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0)
        .single()
        .expect("timestamp")
}

fn snapshot(id: i64, status: &str) -> RowSnapshot {
    RowSnapshot::from_iter([("id", json!(id)), ("status", json!(status))])
}

fn insert(row_id: &str, captured_at: DateTime<Utc>, tx: u64, actor: &str) -> CapturedChange {
    CapturedChange {
        entity: "customers".to_string(),
        operation: Operation::Insert,
        row_id: row_id.to_string(),
        old_snapshot: None,
        new_snapshot: Some(snapshot(1, "new")),
        changed_fields: Default::default(),
        redacted_fields: Default::default(),
        captured_at,
        context: CaptureContext::for_actor(actor).with_tenant("acme"),
        transaction_id: tx,
        sequence: 0,
    }
}

fn update(row_id: &str, captured_at: DateTime<Utc>, tx: u64, sequence: u32) -> CapturedChange {
    CapturedChange {
        entity: "customers".to_string(),
        operation: Operation::Update,
        row_id: row_id.to_string(),
        old_snapshot: Some(snapshot(1, "new")),
        new_snapshot: Some(snapshot(1, "active")),
        changed_fields: ["status".to_string()].into_iter().collect(),
        redacted_fields: Default::default(),
        captured_at,
        context: CaptureContext::for_actor("bob").with_tenant("globex"),
        transaction_id: tx,
        sequence,
    }
}

fn delete(row_id: &str, captured_at: DateTime<Utc>, tx: u64) -> CapturedChange {
    CapturedChange {
        entity: "customers".to_string(),
        operation: Operation::Delete,
        row_id: row_id.to_string(),
        old_snapshot: Some(snapshot(1, "active")),
        new_snapshot: None,
        changed_fields: Default::default(),
        redacted_fields: Default::default(),
        captured_at,
        context: CaptureContext::for_actor("carol"),
        transaction_id: tx,
        sequence: 0,
    }
}

fn rule(name: &str, cooldown_ms: u64) -> AlertRule {
    AlertRule {
        name: name.to_string(),
        metric: AlertMetric::ActorChangeCount,
        window_ms: 3_600_000,
        threshold: 100.0,
        comparator: Comparator::Gt,
        severity: Severity::Warning,
        enabled: true,
        cooldown_ms,
    }
}

#[test]
fn append_assigns_ids_in_commit_order_and_history_is_newest_first() {
    for (name, store) in backends() {
        let first = store
            .append(vec![insert("1", at(10, 9, 0), 1, "alice")])
            .expect("append insert");
        let second = store
            .append(vec![update("1", at(10, 9, 5), 2, 0), update("1", at(10, 9, 5), 2, 1)])
            .expect("append updates");
        assert!(first[0].id < second[0].id, "{name}");
        assert!(second[0].id < second[1].id, "{name}");

        let history = store.history("customers", "1", 0).expect("history");
        let sequences: Vec<(Operation, u32)> =
            history.iter().map(|r| (r.operation, r.sequence)).collect();
        assert_eq!(
            sequences,
            vec![
                (Operation::Update, 1),
                (Operation::Update, 0),
                (Operation::Insert, 0)
            ],
            "{name}"
        );

        let limited = store.history("customers", "1", 1).expect("limited");
        assert_eq!(limited.len(), 1, "{name}");
        assert_eq!(limited[0].sequence, 1, "{name}");

        let after = store
            .changes_after("customers", "1", at(10, 9, 0))
            .expect("changes after");
        assert_eq!(after.len(), 2, "{name}");
    }
}

#[test]
fn append_rejects_the_whole_batch_on_invalid_change() {
    for (name, store) in backends() {
        let mut broken = insert("2", at(10, 9, 0), 1, "alice");
        broken.old_snapshot = Some(snapshot(2, "new"));
        let err = store
            .append(vec![insert("1", at(10, 9, 0), 1, "alice"), broken])
            .expect_err("invalid batch");
        assert!(matches!(err, StoreError::Integrity(_)), "{name}");
        assert!(store.history("customers", "1", 0).expect("history").is_empty(), "{name}");
    }
}

#[test]
fn activity_queries_filter_by_range_and_subject() {
    for (name, store) in backends() {
        store
            .append(vec![
                insert("1", at(10, 9, 0), 1, "alice"),
                insert("2", at(10, 10, 0), 2, "alice"),
                insert("3", at(11, 9, 0), 3, "carol"),
            ])
            .expect("append");
        store
            .append(vec![update("1", at(10, 11, 0), 4, 0)])
            .expect("append update");

        let day = TimeRange::new(at(10, 0, 0), at(11, 0, 0));
        let alice = store.by_actor("alice", day, 0).expect("by actor");
        assert_eq!(alice.len(), 2, "{name}");
        assert_eq!(alice[0].row_id, "2", "{name}");

        let acme = store.by_tenant("acme", day, 10).expect("by tenant");
        assert_eq!(acme.len(), 2, "{name}");
        let globex = store.by_tenant("globex", day, 10).expect("by tenant");
        assert_eq!(globex.len(), 1, "{name}");

        let transaction = store.by_transaction(4).expect("by transaction");
        assert_eq!(transaction.len(), 1, "{name}");
        assert_eq!(transaction[0].operation, Operation::Update, "{name}");

        let summary = store.summary(day).expect("summary");
        assert_eq!(summary.len(), 2, "{name}");
        assert_eq!(summary[0].operation, Operation::Insert, "{name}");
        assert_eq!(summary[0].count, 2, "{name}");
        assert_eq!(summary[1].count, 1, "{name}");

        let inserts = ChangeFilter {
            entity: Some("customers".to_string()),
            operation: Some(Operation::Insert),
        };
        assert_eq!(store.count(day, &inserts).expect("count"), 2, "{name}");
        assert_eq!(
            store.count(day, &ChangeFilter::default()).expect("count all"),
            3,
            "{name}"
        );

        let top = store.top_actor(day).expect("top actor").expect("some actor");
        assert_eq!(top.subject, "alice", "{name}");
        assert_eq!(top.count, 2, "{name}");
        let top_tenant = store.top_tenant(day).expect("top tenant").expect("some tenant");
        assert_eq!(top_tenant.subject, "acme", "{name}");

        let empty = TimeRange::new(at(20, 0, 0), at(21, 0, 0));
        assert!(store.top_actor(empty).expect("top actor").is_none(), "{name}");
    }
}

#[test]
fn claims_are_exclusive_until_released_or_expired() {
    for (name, store) in backends() {
        let now = at(10, 9, 0);
        let lease = Duration::seconds(30);
        let ids = store
            .enqueue(
                vec![
                    insert("1", now, 1, "alice"),
                    insert("2", now, 1, "alice"),
                    insert("3", now, 1, "alice"),
                ],
                now,
            )
            .expect("enqueue");
        assert_eq!(ids.len(), 3, "{name}");

        let a = store.claim("worker-a", 2, now, lease).expect("claim a");
        let b = store.claim("worker-b", 10, now, lease).expect("claim b");
        assert_eq!(a.len(), 2, "{name}");
        assert_eq!(b.len(), 1, "{name}");
        assert!(a.iter().all(|entry| entry.id != b[0].id), "{name}");

        let depth = store.depth(now).expect("depth");
        assert_eq!((depth.pending, depth.claimed), (0, 3), "{name}");

        let released = store.release("worker-b", &[b[0].id]).expect("release");
        assert_eq!(released, 1, "{name}");
        assert_eq!(store.depth(now).expect("depth").pending, 1, "{name}");

        // worker-a stalls past its lease; worker-c takes over.
        let later = now + Duration::seconds(31);
        let c = store.claim("worker-c", 10, later, lease).expect("claim c");
        assert_eq!(c.len(), 3, "{name}");

        let a_ids: Vec<u64> = a.iter().map(|entry| entry.id).collect();
        let stale = store.promote("worker-a", &a_ids).expect("stale promote");
        assert!(stale.is_empty(), "{name}");

        let c_ids: Vec<u64> = c.iter().map(|entry| entry.id).collect();
        let promoted = store.promote("worker-c", &c_ids).expect("promote");
        assert_eq!(promoted.len(), 3, "{name}");
        assert_eq!(store.depth(later).expect("depth").total(), 0, "{name}");
        assert_eq!(
            store.count(TimeRange::new(at(10, 0, 0), at(11, 0, 0)), &ChangeFilter::default())
                .expect("count"),
            3,
            "{name}"
        );
    }
}

#[test]
fn partitions_absorb_default_records_and_retire_atomically() {
    for (name, store) in backends() {
        store
            .append(vec![insert("1", at(10, 9, 0), 1, "alice")])
            .expect("append");

        let march = store
            .create_partition(PartitionPeriod::Monthly, at(10, 0, 0))
            .expect("create march");
        assert_eq!(march.name, "change_records_p202403", "{name}");
        assert_eq!(march.record_count, 1, "{name}");
        let again = store
            .create_partition(PartitionPeriod::Monthly, at(20, 0, 0))
            .expect("idempotent create");
        assert_eq!(again.name, march.name, "{name}");

        let overlap = store
            .create_partition(PartitionPeriod::Daily, at(15, 0, 0))
            .expect_err("overlapping daily partition");
        assert!(matches!(overlap, StoreError::Conflict(_)), "{name}");

        let listed = store.list_partitions().expect("list");
        assert_eq!(listed.len(), 2, "{name}");
        assert_eq!(listed[0].record_count, 1, "{name}");
        assert_eq!(listed[1].name, DEFAULT_PARTITION, "{name}");
        assert_eq!(listed[1].record_count, 0, "{name}");

        // New records land in the matching partition.
        store
            .append(vec![update("1", at(12, 9, 0), 2, 0)])
            .expect("append update");
        assert_eq!(store.history("customers", "1", 0).expect("history").len(), 2, "{name}");

        let archived = store
            .retire_partition(&march.name, RetentionAction::Archive, at(31, 0, 0))
            .expect("archive");
        assert_eq!(archived.state, PartitionState::Archived, "{name}");
        assert_eq!(archived.record_count, 2, "{name}");
        assert!(store.history("customers", "1", 0).expect("history").is_empty(), "{name}");
        assert_eq!(store.read_archived(&march.name).expect("cold read").len(), 2, "{name}");

        let repeat = store
            .retire_partition(&march.name, RetentionAction::Drop, at(31, 1, 0))
            .expect("repeat retire");
        assert_eq!(repeat.state, PartitionState::Archived, "{name}");

        let recreate = store
            .create_partition(PartitionPeriod::Monthly, at(10, 0, 0))
            .expect_err("retired partitions are never reopened");
        assert!(matches!(recreate, StoreError::Conflict(_)), "{name}");
    }
}

#[test]
fn dropped_partitions_are_not_readable_from_the_cold_namespace() {
    for (name, store) in backends() {
        let april = Utc
            .with_ymd_and_hms(2024, 4, 2, 8, 0, 0)
            .single()
            .expect("timestamp");
        let partition = store
            .create_partition(PartitionPeriod::Monthly, april)
            .expect("create april");
        store
            .append(vec![insert("7", april, 1, "alice")])
            .expect("append");
        let dropped = store
            .retire_partition(&partition.name, RetentionAction::Drop, april)
            .expect("drop");
        assert_eq!(dropped.state, PartitionState::Dropped, "{name}");
        assert_eq!(dropped.record_count, 1, "{name}");
        let err = store.read_archived(&partition.name).expect_err("dropped");
        assert!(matches!(err, StoreError::NotFound(_)), "{name}");

        let missing = store
            .retire_partition("change_records_p209901", RetentionAction::Archive, april)
            .expect_err("missing partition");
        assert!(matches!(missing, StoreError::NotFound(_)), "{name}");
    }
}

#[test]
fn alert_firings_respect_cooldown_and_acknowledgement_is_idempotent() {
    for (name, store) in backends() {
        store.put_rule(rule("actor-burst", 3_600_000)).expect("put rule");
        let firing = |fired_at| AlertFiring {
            rule_name: "actor-burst".to_string(),
            fired_at,
            observed_value: 101.0,
            severity: Severity::Warning,
            subject: Some("alice".to_string()),
        };

        let first = store
            .fire_if_cooled(firing(at(10, 9, 0)))
            .expect("fire")
            .expect("first firing");
        assert!(store.fire_if_cooled(firing(at(10, 9, 30))).expect("fire").is_none(), "{name}");
        let second = store
            .fire_if_cooled(firing(at(10, 10, 0)))
            .expect("fire")
            .expect("cooldown elapsed");

        let events = store
            .events(TimeRange::new(at(10, 0, 0), at(11, 0, 0)))
            .expect("events");
        let ids: Vec<u64> = events.iter().map(|event| event.id).collect();
        assert_eq!(ids, vec![second.id, first.id], "{name}");

        let acked = store.acknowledge(first.id, "ops", at(10, 11, 0)).expect("ack");
        assert_eq!(acked.acknowledged_by.as_deref(), Some("ops"), "{name}");
        let again = store.acknowledge(first.id, "someone-else", at(10, 12, 0)).expect("ack");
        assert_eq!(again.acknowledged_by.as_deref(), Some("ops"), "{name}");
        assert_eq!(again.acknowledged_at, Some(at(10, 11, 0)), "{name}");

        let unknown = AlertFiring {
            rule_name: "missing".to_string(),
            ..firing(at(10, 9, 0))
        };
        assert!(matches!(
            store.fire_if_cooled(unknown),
            Err(StoreError::NotFound(_))
        ));
    }
}

#[test]
fn rules_round_trip_and_toggle() {
    for (name, store) in backends() {
        store.put_rule(rule("b-rule", 0)).expect("put b");
        store.put_rule(rule("a-rule", 0)).expect("put a");
        store.set_rule_enabled("b-rule", false).expect("disable");
        let rules = store.list_rules().expect("rules");
        assert_eq!(rules.len(), 2, "{name}");
        assert_eq!(rules[0].name, "a-rule", "{name}");
        assert!(!rules[1].enabled, "{name}");
        assert!(matches!(
            store.set_rule_enabled("missing", true),
            Err(StoreError::NotFound(_))
        ));

        let mut invalid = rule("", 0);
        invalid.name = " ".to_string();
        assert!(matches!(store.put_rule(invalid), Err(StoreError::Integrity(_))));
    }
}

#[test]
fn insert_and_delete_records_read_back_without_the_missing_snapshot() {
    for (name, store) in backends() {
        store
            .append(vec![insert("1", at(10, 9, 0), 1, "alice")])
            .expect("insert");
        store
            .append(vec![update("1", at(10, 10, 0), 2, 0)])
            .expect("update");
        store.append(vec![delete("1", at(10, 11, 0), 3)]).expect("delete");

        let history = store.history("customers", "1", 0).expect(name);
        assert_eq!(history.len(), 3, "{name}");
        assert_eq!(history[0].operation, Operation::Delete, "{name}");
        assert_eq!(history[0].new_snapshot, None, "{name}");
        assert_eq!(history[0].old_snapshot, Some(snapshot(1, "active")), "{name}");
        assert_eq!(history[2].operation, Operation::Insert, "{name}");
        assert_eq!(history[2].old_snapshot, None, "{name}");
        assert_eq!(history[2].new_snapshot, Some(snapshot(1, "new")), "{name}");

        let since = store
            .changes_after("customers", "1", at(10, 8, 0))
            .expect(name);
        assert_eq!(since.len(), 3, "{name}");
    }
}

#[test]
fn queued_captures_are_counted_per_row_until_promoted() {
    for (name, store) in backends() {
        store
            .enqueue(
                vec![
                    insert("1", at(10, 9, 0), 1, "alice"),
                    update("1", at(10, 9, 5), 2, 0),
                    insert("2", at(10, 9, 10), 3, "alice"),
                ],
                at(10, 9, 10),
            )
            .expect("enqueue");
        assert_eq!(store.queued_for_row("customers", "1").expect(name), 2, "{name}");
        assert_eq!(store.queued_for_row("customers", "2").expect(name), 1, "{name}");
        assert_eq!(store.queued_for_row("orders", "1").expect(name), 0, "{name}");

        let claimed = store
            .claim("w1", 10, at(10, 9, 11), Duration::seconds(30))
            .expect("claim");
        assert_eq!(store.queued_for_row("customers", "1").expect(name), 2, "{name}");
        let ids: Vec<u64> = claimed.iter().map(|entry| entry.id).collect();
        store.promote("w1", &ids).expect("promote");
        assert_eq!(store.queued_for_row("customers", "1").expect(name), 0, "{name}");
    }
}

#[test]
fn capture_policy_is_kept_by_the_backend() {
    for (name, store) in backends() {
        assert!(!store.capture_enabled("customers").expect(name), "{name}");
        store.set_capture_enabled("orders", true).expect("enable");
        store.set_capture_enabled("customers", true).expect("enable");
        store.set_capture_enabled("customers", true).expect("enable twice");
        store.set_capture_enabled("orders", false).expect("disable");
        assert_eq!(
            store.enabled_entities().expect(name),
            vec!["customers".to_string()],
            "{name}"
        );

        store
            .put_exclusion(ExclusionRule {
                entity: "customers".to_string(),
                field: "ssn".to_string(),
                reason: "pii".to_string(),
            })
            .expect("exclusion");
        store
            .put_exclusion(ExclusionRule {
                entity: "customers".to_string(),
                field: "ssn".to_string(),
                reason: "government id".to_string(),
            })
            .expect("replace exclusion");
        let rules = store.exclusion_rules().expect(name);
        assert_eq!(rules.len(), 1, "{name}");
        assert_eq!(rules[0].reason, "government id", "{name}");
        assert!(store
            .entity_exclusions("customers")
            .expect(name)
            .is_excluded("ssn"));
        assert!(store.entity_exclusions("orders").expect(name).is_empty());

        assert!(store.delete_exclusion("customers", "ssn").expect(name), "{name}");
        assert!(!store.delete_exclusion("customers", "ssn").expect(name), "{name}");
    }
}

#[test]
fn sqlite_policy_survives_reopening_the_file() {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let path = std::env::temp_dir().join(format!(
        "changetrail-policy-{}-{nanos}.sqlite",
        std::process::id()
    ));
    let path = path.to_string_lossy().to_string();
    {
        let store = SqliteTrailStore::open(&path).expect("open");
        store.ensure_schema().expect("schema");
        store.set_capture_enabled("customers", true).expect("enable");
        store
            .put_exclusion(ExclusionRule {
                entity: "customers".to_string(),
                field: "password_hash".to_string(),
                reason: "credential".to_string(),
            })
            .expect("exclusion");
    }

    let reopened = SqliteTrailStore::open(&path).expect("reopen");
    reopened.ensure_schema().expect("schema");
    assert!(reopened.capture_enabled("customers").expect("capture flag"));
    assert!(reopened
        .entity_exclusions("customers")
        .expect("exclusions")
        .is_excluded("password_hash"));
    drop(reopened);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(format!("{path}.archive"));
}
