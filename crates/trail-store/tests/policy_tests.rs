use trail_store::{
    CaptureContext, CapturePolicy, ContextProvider, ExclusionRule, InMemoryCapturePolicy,
};

fn exclusion(entity: &str, field: &str) -> ExclusionRule {
    ExclusionRule {
        entity: entity.to_string(),
        field: field.to_string(),
        reason: "sensitive".to_string(),
    }
}

#[test]
fn capture_toggles_per_entity() {
    let policy = InMemoryCapturePolicy::new();
    assert!(!policy.is_capture_enabled("customers"));
    policy.enable_capture("customers");
    policy.enable_capture("orders");
    assert!(policy.is_capture_enabled("customers"));
    policy.disable_capture("customers");
    assert!(!policy.is_capture_enabled("customers"));
    assert_eq!(policy.captured_entities(), vec!["orders".to_string()]);
}

#[test]
fn exclusion_sets_are_snapshots() {
    let policy = InMemoryCapturePolicy::new();
    policy.add_exclusion(exclusion("customers", "password_hash"));
    let before = policy.exclusions_for("customers");
    policy.add_exclusion(exclusion("customers", "ssn"));
    assert!(before.is_excluded("password_hash"));
    assert!(!before.is_excluded("ssn"));
    assert!(policy.exclusions_for("customers").is_excluded("ssn"));
    assert!(policy.exclusions_for("orders").is_empty());
}

#[test]
fn removing_exclusions_reports_whether_anything_changed() {
    let policy = InMemoryCapturePolicy::new();
    policy.add_exclusion(exclusion("customers", "ssn"));
    assert!(policy.remove_exclusion("customers", "ssn"));
    assert!(!policy.remove_exclusion("customers", "ssn"));
    assert!(policy.list_exclusions().is_empty());
}

#[test]
fn capture_context_reads_from_any_provider() {
    struct Session;

    impl ContextProvider for Session {
        fn actor_id(&self) -> Option<String> {
            Some("alice".to_string())
        }
        fn tenant_id(&self) -> Option<String> {
            None
        }
        fn request_id(&self) -> Option<String> {
            Some("req-1".to_string())
        }
        fn client_address(&self) -> Option<String> {
            Some("10.0.0.7".to_string())
        }
    }

    let context = CaptureContext::from_provider(&Session);
    assert_eq!(
        context,
        CaptureContext::for_actor("alice")
            .with_request("req-1")
            .with_client_address("10.0.0.7")
    );
    assert_eq!(CaptureContext::anonymous().actor_id(), None);
}
