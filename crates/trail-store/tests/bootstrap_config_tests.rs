use trail_store::{
    load_from_system_config, resolve_backend_kind, BackendKind, CapturePolicy, ChangelogStore,
    PartitionCatalog, PolicySnapshot, SystemConfigLoader,
};

#[test]
fn bootstrap_defaults_to_sqlite() {
    let config = SystemConfigLoader::from_str(
        r#"
        [storage]
        sqlite_path = ":memory:"
        "#,
    )
    .expect("config");
    let bundle = load_from_system_config(&config, None).expect("bundle");
    assert_eq!(
        bundle.kind,
        BackendKind::Sqlite {
            path: ":memory:".to_string(),
            archive_path: ":memory:".to_string()
        }
    );
    let partitions = bundle.backend.list_partitions().expect("partitions");
    assert_eq!(partitions.len(), 1);
    assert!(partitions[0].is_default());
    assert_eq!(bundle.backend.next_transaction_id().expect("txid"), 1);
}

#[test]
fn dsn_prefix_selects_the_backend() {
    let sqlite = SystemConfigLoader::from_str(
        r#"
        [storage]
        dsn = "sqlite://audit.db"
        "#,
    )
    .expect("config");
    assert_eq!(
        resolve_backend_kind(&sqlite),
        BackendKind::Sqlite {
            path: "audit.db".to_string(),
            archive_path: "audit.db.archive".to_string()
        }
    );

    let postgres = SystemConfigLoader::from_str(
        r#"
        [storage]
        dsn = "host=localhost user=trail"
        "#,
    )
    .expect("config");
    assert!(matches!(
        resolve_backend_kind(&postgres),
        BackendKind::Postgres { .. }
    ));

    let memory = SystemConfigLoader::from_str(
        r#"
        [storage]
        dsn = "memory:"
        "#,
    )
    .expect("config");
    assert_eq!(resolve_backend_kind(&memory), BackendKind::Memory);
}

#[test]
fn bootstrap_seeds_the_capture_policy() {
    let config = SystemConfigLoader::from_str(
        r#"
        [storage]
        dsn = "memory:"
        "#,
    )
    .expect("config");
    let seed: PolicySnapshot = serde_json::from_value(serde_json::json!({
        "captured_entities": ["customers"],
        "exclusions": [
            { "entity": "customers", "field": "password_hash", "reason": "credential" }
        ]
    }))
    .expect("seed");
    let bundle = load_from_system_config(&config, Some(&seed)).expect("bundle");
    assert!(bundle
        .policy
        .is_capture_enabled("customers")
        .expect("capture flag"));
    assert!(!bundle.policy.is_capture_enabled("orders").expect("capture flag"));
    assert!(bundle
        .policy
        .exclusions_for("customers")
        .expect("exclusions")
        .is_excluded("password_hash"));
    assert_eq!(bundle.policy.snapshot().expect("snapshot"), seed);
}
