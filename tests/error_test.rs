//! Tests for error types

use modelpack::{Error, Stage};

#[test]
fn test_not_found_error() {
    let error = Error::not_found("app/src/main/assets/mv2_xnnpack.pte");
    let error_str = format!("{error}");
    assert!(error_str.contains("File not found"));
    assert!(error_str.contains("mv2_xnnpack.pte"));
    assert_eq!(error.stage(), None);
}

#[test]
fn test_artifact_missing_error() {
    let error = Error::ArtifactMissing {
        path: "app/src/main/assets/mv2_xnnpack.pte".into(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Artifact not found"));
    assert!(error_str.contains("Build the model before publishing"));
    assert_eq!(error.stage(), None);
}

#[test]
fn test_manifest_mismatch_error() {
    let error = Error::ManifestMismatch {
        path: "model.pte".into(),
        expected: "aa".repeat(32),
        actual: "bb".repeat(32),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Content hash mismatch"));
    assert!(error_str.contains(&"aa".repeat(32)));
    assert!(error_str.contains(&"bb".repeat(32)));
    assert!(error_str.contains("rebuild it before publishing"));
}

#[test]
fn test_duplicate_key_error() {
    let error = Error::DuplicateKey {
        kind: "metric",
        key: "top1_accuracy".to_string(),
        run_id: "abc".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Duplicate metric key 'top1_accuracy'"));
    assert!(error_str.contains("write-once"));
}

#[test]
fn test_connection_error_points_at_config() {
    let error = Error::Connection("connection refused".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("connection refused"));
    assert!(error_str.contains("MLFLOW_TRACKING_URI"));
}

#[test]
fn test_export_error_is_actionable() {
    let error = Error::Export("data-dependent branch".to_string());
    assert!(format!("{error}").contains("evaluation-mode"));
}

#[test]
fn test_stage_attribution() {
    assert_eq!(Error::Export(String::new()).stage(), Some(Stage::Export));
    assert_eq!(Error::Lowering(String::new()).stage(), Some(Stage::Lower));
    assert_eq!(Error::Serialization(String::new()).stage(), Some(Stage::Serialize));
    assert_eq!(Error::Validation(String::new()).stage(), Some(Stage::Validate));
    assert_eq!(Error::Runtime(String::new()).stage(), Some(Stage::Validate));
    assert_eq!(Error::Upload(String::new()).stage(), None);
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let error: Error = io.into();
    assert!(matches!(error, Error::Io(_)));
    assert!(format!("{error}").contains("denied"));
}

#[test]
fn test_error_debug_format() {
    let error = Error::RunSealed("abc".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("RunSealed"));
}
