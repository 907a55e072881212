mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration;
use support::{at, customer, FlakyBackend};
use trail_kernel::{AlertEvaluator, CaptureConfig, CaptureInterceptor, Mutation};
use trail_store::{
    AlertMetric, AlertRule, AlertStore, CaptureContext, CapturePolicy, CaptureQueue,
    CapturedChange, Clock, Comparator, InMemoryCapturePolicy, InMemoryTrailStore, ManualClock,
    Operation, Severity, TimeRange, TrailBackend,
};

fn rule(name: &str, metric: AlertMetric, threshold: f64, cooldown: Duration) -> AlertRule {
    AlertRule {
        name: name.to_string(),
        metric,
        window_ms: 3_600_000,
        threshold,
        comparator: Comparator::Gt,
        severity: Severity::Warning,
        enabled: true,
        cooldown_ms: cooldown.num_milliseconds() as u64,
    }
}

fn interceptor(backend: Arc<dyn TrailBackend>, clock: Arc<ManualClock>) -> CaptureInterceptor {
    let policy = InMemoryCapturePolicy::shared();
    policy.enable_capture("customers");
    CaptureInterceptor::new(CaptureConfig::default(), policy, backend, clock)
}

fn change_by(interceptor: &CaptureInterceptor, clock: &ManualClock, actor: &str, row: usize) {
    clock.advance(Duration::seconds(10));
    interceptor
        .capture_one(
            CaptureContext::for_actor(actor).with_tenant("acme"),
            &Mutation::insert("customers", row.to_string(), customer(row as i64, actor, "new")),
        )
        .expect("capture");
}

#[test]
fn hundred_and_first_change_by_one_actor_fires_once() {
    let backend: Arc<dyn TrailBackend> = InMemoryTrailStore::shared();
    let clock = ManualClock::shared(at(10, 9, 0));
    let interceptor = interceptor(backend.clone(), clock.clone());
    backend
        .put_rule(rule(
            "actor-burst",
            AlertMetric::ActorChangeCount,
            100.0,
            Duration::hours(1),
        ))
        .expect("rule");
    let evaluator = AlertEvaluator::new(backend.clone(), clock.clone());

    for row in 0..100 {
        change_by(&interceptor, &clock, "alice", row);
    }
    change_by(&interceptor, &clock, "bob", 1000);
    let quiet = evaluator
        .evaluate_at(clock.now() + Duration::seconds(1))
        .expect("evaluate");
    assert!(quiet.fired.is_empty());

    change_by(&interceptor, &clock, "alice", 100);
    let report = evaluator
        .evaluate_at(clock.now() + Duration::seconds(1))
        .expect("evaluate");
    assert_eq!(report.fired.len(), 1);
    let event = &report.fired[0];
    assert_eq!(event.rule_name, "actor-burst");
    assert_eq!(event.observed_value, 101.0);
    assert_eq!(event.subject.as_deref(), Some("alice"));
    assert_eq!(event.severity, Severity::Warning);

    change_by(&interceptor, &clock, "alice", 101);
    let again = evaluator
        .evaluate_at(clock.now() + Duration::seconds(1))
        .expect("evaluate");
    assert!(again.fired.is_empty());
    assert_eq!(again.suppressed, vec!["actor-burst".to_string()]);

    let all = backend
        .events(TimeRange::new(at(10, 0, 0), at(11, 0, 0)))
        .expect("events");
    assert_eq!(all.len(), 1);
}

#[test]
fn firings_are_never_closer_than_the_cooldown() {
    let backend: Arc<dyn TrailBackend> = InMemoryTrailStore::shared();
    let clock = ManualClock::shared(at(10, 9, 0));
    let cooldown = Duration::minutes(10);
    backend
        .put_rule(rule("backlog", AlertMetric::QueueDepth, 0.0, cooldown))
        .expect("rule");
    backend
        .enqueue(
            vec![CapturedChange {
                entity: "customers".to_string(),
                operation: Operation::Insert,
                row_id: "1".to_string(),
                old_snapshot: None,
                new_snapshot: Some(customer(1, "Alice", "new")),
                changed_fields: Default::default(),
                redacted_fields: Default::default(),
                captured_at: clock.now(),
                context: CaptureContext::anonymous(),
                transaction_id: 1,
                sequence: 0,
            }],
            clock.now(),
        )
        .expect("enqueue");
    let evaluator = AlertEvaluator::new(backend.clone(), clock.clone());

    for _ in 0..=30 {
        evaluator.evaluate().expect("evaluate");
        clock.advance(Duration::minutes(1));
    }

    let events = backend
        .events(TimeRange::new(at(10, 0, 0), at(11, 0, 0)))
        .expect("events");
    assert_eq!(events.len(), 4);
    let mut fired: Vec<_> = events.iter().map(|event| event.fired_at).collect();
    fired.sort();
    assert!(fired.windows(2).all(|pair| pair[1] - pair[0] >= cooldown));
}

#[test]
fn one_failing_rule_does_not_block_the_others() {
    let backend = FlakyBackend::shared();
    let clock = ManualClock::shared(at(10, 9, 0));
    let interceptor = interceptor(backend.clone(), clock.clone());
    backend
        .put_rule(rule("tenant-burst", AlertMetric::TenantChangeCount, 0.0, Duration::hours(1)))
        .expect("tenant rule");
    backend
        .put_rule(rule("actor-burst", AlertMetric::ActorChangeCount, 0.0, Duration::hours(1)))
        .expect("actor rule");
    change_by(&interceptor, &clock, "alice", 1);
    backend.fail_top_tenant.store(true, Ordering::SeqCst);

    let evaluator = AlertEvaluator::new(backend.clone(), clock.clone());
    let report = evaluator
        .evaluate_at(clock.now() + Duration::seconds(1))
        .expect("cycle completes");
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].rule, "tenant-burst");
    assert_eq!(report.fired.len(), 1);
    assert_eq!(report.fired[0].rule_name, "actor-burst");
}

#[test]
fn disabled_rules_and_filtered_counts() {
    let backend: Arc<dyn TrailBackend> = InMemoryTrailStore::shared();
    let clock = ManualClock::shared(at(10, 9, 0));
    let interceptor = interceptor(backend.clone(), clock.clone());
    for row in 0..3 {
        change_by(&interceptor, &clock, "alice", row);
    }
    backend
        .put_rule(rule(
            "deletes",
            AlertMetric::ChangeCount {
                entity: Some("customers".to_string()),
                operation: Some(Operation::Delete),
            },
            0.0,
            Duration::hours(1),
        ))
        .expect("delete rule");
    backend
        .put_rule(rule(
            "inserts",
            AlertMetric::ChangeCount {
                entity: Some("customers".to_string()),
                operation: Some(Operation::Insert),
            },
            2.0,
            Duration::hours(1),
        ))
        .expect("insert rule");
    backend
        .set_rule_enabled("deletes", false)
        .expect("disable");

    let evaluator = AlertEvaluator::new(backend.clone(), clock.clone());
    let report = evaluator
        .evaluate_at(clock.now() + Duration::seconds(1))
        .expect("evaluate");
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.fired.len(), 1);
    assert_eq!(report.fired[0].observed_value, 3.0);
    assert_eq!(report.fired[0].subject, None);
}
