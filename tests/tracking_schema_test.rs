//! Run lifecycle rules of the tracking store

use std::collections::BTreeMap;

use modelpack::tracking::{MemoryTrackingStore, RunRecord, RunStatus, TrackingStore};
use modelpack::Error;

#[tokio::test]
async fn test_experiment_is_idempotent() {
    let store = MemoryTrackingStore::new();
    let a = store.get_or_create_experiment("MobileNetV2").await.unwrap();
    let b = store.get_or_create_experiment("MobileNetV2").await.unwrap();
    let c = store.get_or_create_experiment("Other").await.unwrap();

    assert_eq!(a.experiment_id(), b.experiment_id());
    assert_ne!(a.experiment_id(), c.experiment_id());
    assert_eq!(store.experiment_count(), 2);
}

#[tokio::test]
async fn test_param_and_metric_keys_are_write_once() {
    let store = MemoryTrackingStore::new();
    let exp = store.get_or_create_experiment("e").await.unwrap();
    let run = store.create_run(exp.experiment_id(), "r").await.unwrap();

    store.log_param(run.run_id(), "base_model", "MobileNetV2").await.unwrap();
    let err = store.log_param(run.run_id(), "base_model", "ResNet").await.unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { kind: "param", .. }));

    store.log_metric(run.run_id(), "acc", 0.5).await.unwrap();
    let err = store.log_metric(run.run_id(), "acc", 0.6).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { kind: "metric", .. }));

    let fetched = store.get_run(run.run_id()).await.unwrap();
    assert_eq!(fetched.params()["base_model"], "MobileNetV2");
    assert_eq!(fetched.metrics()["acc"], 0.5);
}

#[tokio::test]
async fn test_sealed_run_rejects_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("m.pte");
    std::fs::write(&file, b"x").unwrap();

    let store = MemoryTrackingStore::new();
    let exp = store.get_or_create_experiment("e").await.unwrap();
    let run = store.create_run(exp.experiment_id(), "r").await.unwrap();
    store.end_run(run.run_id(), RunStatus::Success).await.unwrap();

    assert!(matches!(store.log_param(run.run_id(), "k", "v").await, Err(Error::RunSealed(_))));
    assert!(matches!(store.log_metric(run.run_id(), "k", 1.0).await, Err(Error::RunSealed(_))));
    assert!(matches!(
        store.log_artifact(run.run_id(), &file, "model_files").await,
        Err(Error::RunSealed(_))
    ));
    assert!(matches!(
        store.end_run(run.run_id(), RunStatus::Failed).await,
        Err(Error::RunSealed(_))
    ));

    let fetched = store.get_run(run.run_id()).await.unwrap();
    assert_eq!(fetched.status(), RunStatus::Success);
    assert!(fetched.ended_at().is_some());
}

#[tokio::test]
async fn test_unknown_run() {
    let store = MemoryTrackingStore::new();
    assert!(matches!(store.get_run("nope").await, Err(Error::RunNotFound(_))));
}

#[tokio::test]
async fn test_bulk_logging_in_key_order() {
    let store = MemoryTrackingStore::new();
    let exp = store.get_or_create_experiment("e").await.unwrap();
    let run = store.create_run(exp.experiment_id(), "r").await.unwrap();

    let metrics = BTreeMap::from([("b".to_string(), 2.0), ("a".to_string(), 1.0)]);
    store.log_metrics(run.run_id(), &metrics).await.unwrap();

    let keys: Vec<String> = store
        .metrics_for_run(run.run_id())
        .iter()
        .map(|m| m.key().to_string())
        .collect();
    assert_eq!(keys, ["a", "b"]);
}

#[test]
fn test_run_status_wire_names() {
    for status in [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Success,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ] {
        assert_eq!(RunStatus::from_mlflow(status.as_mlflow()), Some(status));
    }
    assert_eq!(RunStatus::Success.as_mlflow(), "FINISHED");
    assert!(RunStatus::Failed.is_terminal());
    assert!(!RunStatus::Running.is_terminal());
}

#[test]
fn test_run_record_serde() {
    let run = RunRecord::builder("r1", "e1")
        .run_name("quantized_model_v1")
        .status(RunStatus::Running)
        .build();
    let json = serde_json::to_string(&run).unwrap();
    let back: RunRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back, run);
}
