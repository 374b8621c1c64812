use ticketlens_core::errors::{ExError, ExErrorKind};

#[test]
fn test_error_kind_code_mapping() {
    // Test that each kind has a stable, unique code
    let kinds = vec![
        (ExErrorKind::InvalidInput, "ERR_INVALID_INPUT"),
        (ExErrorKind::MissingDependency, "ERR_MISSING_DEPENDENCY"),
        (ExErrorKind::CycleDetected, "ERR_CYCLE_DETECTED"),
        (ExErrorKind::MigrationFailed, "ERR_MIGRATION_FAILED"),
        (ExErrorKind::MigrationDrift, "ERR_MIGRATION_DRIFT"),
        (ExErrorKind::Initialization, "ERR_INITIALIZATION"),
        (ExErrorKind::NotInitialized, "ERR_NOT_INITIALIZED"),
        (ExErrorKind::Statement, "ERR_STATEMENT"),
        (ExErrorKind::Transaction, "ERR_TRANSACTION"),
        (ExErrorKind::Persistence, "ERR_PERSISTENCE"),
    ];

    let mut seen = std::collections::HashSet::new();
    for (kind, expected_code) in kinds {
        assert_eq!(kind.code(), expected_code);
        assert!(seen.insert(expected_code), "duplicate code {}", expected_code);
    }
}

#[test]
fn test_migration_failure_carries_version_and_direction() {
    let cause = ExError::new(ExErrorKind::Statement).with_message("no such table: tickets");
    let err = ExError::new(ExErrorKind::MigrationFailed)
        .with_op("migration_down")
        .with_entity_id("004")
        .with_message("Migration 004 failed")
        .with_source(cause);

    assert_eq!(err.code(), "ERR_MIGRATION_FAILED");
    assert_eq!(err.op(), Some("migration_down"));
    assert_eq!(err.entity_id(), Some("004"));
    assert_eq!(
        err.source_error().map(|e| e.message()),
        Some("no such table: tickets")
    );
}

#[test]
fn test_wrapping_preserves_root_cause() {
    let root = ExError::new(ExErrorKind::Io).with_message("permission denied");
    let save = ExError::new(ExErrorKind::Persistence)
        .with_op("save_to_disk")
        .with_source(root);
    let init = ExError::new(ExErrorKind::Initialization)
        .with_op("initialize")
        .with_message("failed after 3 attempts")
        .with_source(save);

    assert_eq!(init.root_cause().kind(), ExErrorKind::Io);
    assert_eq!(init.root_cause().message(), "permission denied");
}

#[test]
fn test_clone_is_independent_of_original() {
    let err = ExError::new(ExErrorKind::Persistence).with_message("disk full");
    let cloned = err.clone();
    drop(err);
    assert_eq!(cloned.message(), "disk full");
    assert_eq!(cloned.kind(), ExErrorKind::Persistence);
}

#[test]
fn test_io_and_json_conversions() {
    let io: ExError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert_eq!(io.kind(), ExErrorKind::Io);

    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let ser: ExError = json_err.into();
    assert_eq!(ser.kind(), ExErrorKind::Serialization);
}
