use evcm::error::EvcmError;

#[test]
fn constructors_pick_matching_variants() {
    assert!(matches!(EvcmError::config("x"), EvcmError::Config { .. }));
    assert!(matches!(
        EvcmError::validation("f", "x"),
        EvcmError::Validation { .. }
    ));
    assert!(matches!(EvcmError::io("x"), EvcmError::Io { .. }));
    assert!(matches!(EvcmError::storage("x"), EvcmError::Storage { .. }));
    assert!(matches!(EvcmError::command("x"), EvcmError::Command { .. }));
    assert!(matches!(EvcmError::timeout("x"), EvcmError::Timeout { .. }));
    assert!(matches!(EvcmError::priority("x"), EvcmError::Priority { .. }));
    assert!(matches!(
        EvcmError::phase_switch("x"),
        EvcmError::PhaseSwitch { .. }
    ));
    assert!(matches!(EvcmError::generic("x"), EvcmError::Generic { .. }));
}

#[test]
fn conversions_keep_the_cause() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let e: EvcmError = io.into();
    assert!(matches!(e, EvcmError::Io { .. }));
    assert!(e.to_string().contains("gone"));

    let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let e: EvcmError = json.into();
    assert!(matches!(e, EvcmError::Serialization { .. }));
}

#[test]
fn validation_message_names_field() {
    let e = EvcmError::validation("chargers.garage", "duplicate_id");
    assert_eq!(
        e.to_string(),
        "Validation error: chargers.garage - duplicate_id"
    );
}
