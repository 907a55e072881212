use trail_store::{ConfigError, SystemConfigLoader};

#[test]
fn config_loader_accepts_valid_keys() {
    let input = r#"
[storage]
dsn = "sqlite://local"
sqlite_path = "trail.sqlite"
[capture]
mode = "async"
strict = false
[worker]
batch_size = 25
[retention]
horizon_days = 90
action = "drop"
"#;
    let config = SystemConfigLoader::from_str(input).expect("config");
    assert_eq!(config.get_string("storage.dsn"), "sqlite://local");
    assert_eq!(config.get_string("capture.mode"), "async");
    assert!(!config.get_bool("capture.strict"));
    assert_eq!(config.get_number("worker.batch_size"), 25);
    assert_eq!(config.get_unsigned("retention.horizon_days"), 90);
}

#[test]
fn missing_keys_fall_back_to_table_defaults() {
    let config = SystemConfigLoader::from_str("").expect("config");
    assert_eq!(config.get_string("capture.mode"), "sync");
    assert!(config.get_bool("capture.strict"));
    assert_eq!(config.get_number("worker.lease_ms"), 30_000);
    assert_eq!(config.get_string("partitions.period"), "monthly");
    assert_eq!(config.get_string("security.admin_token"), "");
}

#[test]
fn config_loader_rejects_unknown_key() {
    let input = r#"
unknown = { value = "x" }
"#;
    let err = SystemConfigLoader::from_str(input).expect_err("error");
    match err {
        ConfigError::UnknownKey(key) => assert_eq!(key, "unknown.value"),
        _ => panic!("expected unknown key error"),
    }
}

#[test]
fn config_loader_rejects_type_mismatch() {
    let input = r#"
worker = { batch_size = "lots" }
"#;
    let err = SystemConfigLoader::from_str(input).expect_err("error");
    match err {
        ConfigError::TypeMismatch(key, expected) => {
            assert_eq!(key, "worker.batch_size");
            assert_eq!(expected, "number");
        }
        _ => panic!("expected type mismatch"),
    }
}

#[test]
fn overrides_are_checked_like_file_values() {
    let mut config = SystemConfigLoader::from_str("").expect("config");
    config.set("worker.interval_ms", "250").expect("override");
    assert_eq!(config.get_number("worker.interval_ms"), 250);
    assert!(matches!(
        config.set("worker.interval_ms", "soon"),
        Err(ConfigError::TypeMismatch(_, _))
    ));
    assert!(matches!(
        config.set("worker.threads", "4"),
        Err(ConfigError::UnknownKey(_))
    ));
}
