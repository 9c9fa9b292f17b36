//! In-memory tracking store using `DashMap`.
//!
//! Data is lost on process restart. Used for tests and offline publishing;
//! it enforces the same run rules as a remote store and can simulate an
//! unreachable server or individual failing calls.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use uuid::Uuid;

use super::{
    artifact_key, ArtifactRecord, ExperimentRecord, MetricRecord, RunRecord, RunStatus,
    TrackingStore,
};
use crate::{Error, Result};

/// In-memory tracking store.
///
/// # Example
///
/// ```rust
/// use modelpack::tracking::{MemoryTrackingStore, TrackingStore};
///
/// # async fn example() -> modelpack::Result<()> {
/// let store = MemoryTrackingStore::new();
/// let a = store.get_or_create_experiment("exp").await?;
/// let b = store.get_or_create_experiment("exp").await?;
/// assert_eq!(a.experiment_id(), b.experiment_id());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryTrackingStore {
    experiments: DashMap<String, ExperimentRecord>,
    runs: DashMap<String, RunRecord>,
    metrics: DashMap<String, Vec<MetricRecord>>,
    artifacts: DashMap<String, Vec<(ArtifactRecord, Vec<u8>)>>,
    offline: AtomicBool,
    fail_uploads: AtomicBool,
    fail_metrics: AtomicBool,
    fail_success_seal: AtomicBool,
}

impl MemoryTrackingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable server: every call fails with
    /// [`Error::Connection`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every artifact upload fail with [`Error::Upload`].
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Make every metric write fail with [`Error::Tracking`].
    pub fn fail_metrics(&self, fail: bool) {
        self.fail_metrics.store(fail, Ordering::SeqCst);
    }

    /// Make sealing a run as [`RunStatus::Success`] fail with
    /// [`Error::Connection`]. Other seals still go through.
    pub fn fail_success_seal(&self, fail: bool) {
        self.fail_success_seal.store(fail, Ordering::SeqCst);
    }

    /// Number of experiments.
    #[must_use]
    pub fn experiment_count(&self) -> usize {
        self.experiments.len()
    }

    /// Number of runs across experiments.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// All runs of an experiment, oldest first.
    #[must_use]
    pub fn runs_for_experiment(&self, experiment_id: &str) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|r| r.experiment_id() == experiment_id)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by_key(RunRecord::started_at);
        runs
    }

    /// Metric records of a run in logging order.
    #[must_use]
    pub fn metrics_for_run(&self, run_id: &str) -> Vec<MetricRecord> {
        self.metrics.get(run_id).map(|m| m.value().clone()).unwrap_or_default()
    }

    /// Artifact records of a run in upload order.
    #[must_use]
    pub fn artifacts(&self, run_id: &str) -> Vec<ArtifactRecord> {
        self.artifacts
            .get(run_id)
            .map(|a| a.iter().map(|(record, _)| record.clone()).collect())
            .unwrap_or_default()
    }

    /// Stored bytes of one artifact.
    #[must_use]
    pub fn artifact_bytes(&self, run_id: &str, key: &str) -> Option<Vec<u8>> {
        self.artifacts
            .get(run_id)?
            .iter()
            .find(|(record, _)| record.key() == key)
            .map(|(_, bytes)| bytes.clone())
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Connection("in-memory tracking store is offline".to_string()));
        }
        Ok(())
    }

    fn with_run<T>(&self, run_id: &str, f: impl FnOnce(&mut RunRecord) -> Result<T>) -> Result<T> {
        self.ensure_online()?;
        let mut run = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        f(run.value_mut())
    }
}

impl TrackingStore for MemoryTrackingStore {
    async fn get_or_create_experiment(&self, name: &str) -> Result<ExperimentRecord> {
        self.ensure_online()?;
        let experiment = self
            .experiments
            .entry(name.to_string())
            .or_insert_with(|| {
                let id = Uuid::new_v4().simple().to_string();
                ExperimentRecord::new(&id, name).with_artifact_location(format!("memory://{id}"))
            })
            .value()
            .clone();
        Ok(experiment)
    }

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<RunRecord> {
        self.ensure_online()?;
        let location = self
            .experiments
            .iter()
            .find(|e| e.experiment_id() == experiment_id)
            .and_then(|e| e.artifact_location().map(str::to_string))
            .ok_or_else(|| Error::Tracking(format!("experiment {experiment_id} does not exist")))?;

        let run_id = Uuid::new_v4().simple().to_string();
        let mut run = RunRecord::builder(&run_id, experiment_id)
            .run_name(run_name)
            .artifact_uri(format!("{location}/{run_id}/artifacts"))
            .build();
        run.start()?;
        self.runs.insert(run_id.clone(), run.clone());
        tracing::debug!(run_id = %run_id, run_name, "opened run");
        Ok(run)
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.with_run(run_id, |run| run.insert_param(key, value))
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        if self.fail_metrics.load(Ordering::SeqCst) {
            return Err(Error::Tracking(format!("{key}: simulated metric rejection")));
        }
        self.with_run(run_id, |run| run.insert_metric(key, value))?;
        self.metrics
            .entry(run_id.to_string())
            .or_default()
            .push(MetricRecord::new(run_id, key, 0, value));
        Ok(())
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        subpath: &str,
    ) -> Result<ArtifactRecord> {
        self.with_run(run_id, |run| run.ensure_open())?;
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} has no file name", local_path.display()))
            })?;
        let key = artifact_key(subpath, file_name);
        let bytes = std::fs::read(local_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(local_path),
            _ => Error::Io(e),
        })?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(Error::Upload(format!("{key}: simulated transfer failure")));
        }
        let record = ArtifactRecord::from_file(run_id, &key, local_path)?;
        self.artifacts
            .entry(run_id.to_string())
            .or_default()
            .push((record.clone(), bytes));
        Ok(record)
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        if status == RunStatus::Success && self.fail_success_seal.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("{run_id}: simulated update failure")));
        }
        self.with_run(run_id, |run| run.seal(status))
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        self.ensure_online()?;
        self.runs
            .get(run_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_experiment_is_idempotent() {
        let store = MemoryTrackingStore::new();
        let a = store.get_or_create_experiment("exp").await.unwrap();
        let b = store.get_or_create_experiment("exp").await.unwrap();
        assert_eq!(a.experiment_id(), b.experiment_id());
        assert_eq!(store.experiment_count(), 1);
    }

    #[tokio::test]
    async fn test_runs_get_own_namespace() {
        let store = MemoryTrackingStore::new();
        let exp = store.get_or_create_experiment("exp").await.unwrap();
        let a = store.create_run(exp.experiment_id(), "same").await.unwrap();
        let b = store.create_run(exp.experiment_id(), "same").await.unwrap();
        assert_ne!(a.run_id(), b.run_id());
        assert_ne!(a.artifact_uri(), b.artifact_uri());
        assert_eq!(store.runs_for_experiment(exp.experiment_id()).len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_metric_rejected() {
        let store = MemoryTrackingStore::new();
        let exp = store.get_or_create_experiment("exp").await.unwrap();
        let run = store.create_run(exp.experiment_id(), "r").await.unwrap();
        store.log_metric(run.run_id(), "acc", 0.8).await.unwrap();
        let err = store.log_metric(run.run_id(), "acc", 0.9).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { kind: "metric", .. }));
        assert_eq!(store.metrics_for_run(run.run_id()).len(), 1);
        assert_eq!(store.get_run(run.run_id()).await.unwrap().metrics()["acc"], 0.8);
    }

    #[tokio::test]
    async fn test_sealed_run_rejects_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"abc").unwrap();

        let store = MemoryTrackingStore::new();
        let exp = store.get_or_create_experiment("exp").await.unwrap();
        let run = store.create_run(exp.experiment_id(), "r").await.unwrap();
        store.end_run(run.run_id(), RunStatus::Success).await.unwrap();
        let err = store.log_artifact(run.run_id(), &file, "model_files").await.unwrap_err();
        assert!(matches!(err, Error::RunSealed(_)));
    }

    #[tokio::test]
    async fn test_artifact_stored_under_subpath() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"abc").unwrap();

        let store = MemoryTrackingStore::new();
        let exp = store.get_or_create_experiment("exp").await.unwrap();
        let run = store.create_run(exp.experiment_id(), "r").await.unwrap();
        let record = store.log_artifact(run.run_id(), &file, "model_files").await.unwrap();
        assert_eq!(record.key(), "model_files/a.bin");
        assert_eq!(store.artifact_bytes(run.run_id(), "model_files/a.bin").unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_offline_surfaces_connection_error() {
        let store = MemoryTrackingStore::new();
        store.set_offline(true);
        let err = store.get_or_create_experiment("exp").await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_failed_success_seal_leaves_run_open() {
        let store = MemoryTrackingStore::new();
        let exp = store.get_or_create_experiment("exp").await.unwrap();
        let run = store.create_run(exp.experiment_id(), "r").await.unwrap();
        store.fail_success_seal(true);
        let err = store.end_run(run.run_id(), RunStatus::Success).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        store.end_run(run.run_id(), RunStatus::Failed).await.unwrap();
        let sealed = store.get_run(run.run_id()).await.unwrap();
        assert_eq!(sealed.status(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let store = MemoryTrackingStore::new();
        assert!(matches!(store.get_run("nope").await, Err(Error::RunNotFound(_))));
    }
}
