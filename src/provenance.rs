//! Provenance Recorder
//!
//! Records one published artifact as one sealed run:
//!
//! 1. pre-flight (no run yet): the artifact must exist and a prebuilt
//!    manifest must still match its bytes
//! 2. resolve the experiment, open a run
//! 3. log params and metrics (plus the derived `model_size_mib`)
//! 4. write `manifest.json` to a scratch directory, upload it together with
//!    the artifact under the run's `model_files/` subpath
//! 5. seal the run `Success`, or `Failed` if any step after opening failed
//!
//! A failure before step 2 leaves no trace in the tracking store. A failure
//! after it leaves a sealed, failed run holding whatever was logged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::hasher;
use crate::manifest::{Manifest, MANIFEST_FILE_NAME};
use crate::tracking::{ArtifactRecord, RunId, RunStatus, TrackingStore, DEFAULT_ARTIFACT_SUBPATH};
use crate::{Error, Result};

/// Derived metric: artifact size in MiB.
pub const MODEL_SIZE_METRIC: &str = "model_size_mib";

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// How the recorder obtains the manifest.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestSource {
    /// Use a manifest built earlier; it is re-verified against the artifact.
    Prebuilt(Manifest),
    /// Build one from the artifact and the publication's metrics.
    Build {
        /// Model name recorded in the manifest
        model_name: String,
        /// Semantic-version-like model version
        version: String,
    },
}

/// Everything recorded for one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    /// Human-readable run name (runs with the same name stay distinct)
    pub run_name: String,
    /// Run params
    pub params: BTreeMap<String, String>,
    /// Externally measured metrics
    pub metrics: BTreeMap<String, f64>,
    /// Artifact file to publish
    pub artifact_path: PathBuf,
    /// Manifest to publish alongside
    pub manifest: ManifestSource,
}

impl Publication {
    /// Publication that builds its manifest from the artifact.
    #[must_use]
    pub fn new(
        run_name: impl Into<String>,
        artifact_path: impl Into<PathBuf>,
        model_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            run_name: run_name.into(),
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifact_path: artifact_path.into(),
            manifest: ManifestSource::Build {
                model_name: model_name.into(),
                version: version.into(),
            },
        }
    }

    /// Add a param.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Add several params.
    #[must_use]
    pub fn params<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Add a metric.
    #[must_use]
    pub fn metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    /// Use a prebuilt manifest.
    #[must_use]
    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = ManifestSource::Prebuilt(manifest);
        self
    }
}

/// Outcome of a successful recording.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRun {
    /// Sealed run
    pub run_id: RunId,
    /// Manifest that was uploaded
    pub manifest: Manifest,
    /// Uploaded files (artifact first, then manifest)
    pub artifacts: Vec<ArtifactRecord>,
}

/// Records artifacts and their manifests into a [`TrackingStore`].
pub struct ProvenanceRecorder<S> {
    store: S,
    experiment_name: String,
    artifact_subpath: String,
}

impl<S: TrackingStore> ProvenanceRecorder<S> {
    /// Recorder writing into `experiment_name` of `store`.
    pub fn new(store: S, experiment_name: impl Into<String>) -> Self {
        Self {
            store,
            experiment_name: experiment_name.into(),
            artifact_subpath: DEFAULT_ARTIFACT_SUBPATH.to_string(),
        }
    }

    /// Change the subpath used inside each run's artifact namespace.
    #[must_use]
    pub fn with_artifact_subpath(mut self, subpath: impl Into<String>) -> Self {
        self.artifact_subpath = subpath.into();
        self
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Record `publication` and return the sealed run's id.
    ///
    /// # Errors
    ///
    /// See [`ProvenanceRecorder::publish`].
    pub async fn record(&self, publication: Publication) -> Result<RunId> {
        self.publish(publication).await.map(|run| run.run_id)
    }

    /// Record `publication` and return the run, manifest and uploads.
    ///
    /// # Errors
    ///
    /// Before a run is opened: [`Error::ArtifactMissing`] for a missing
    /// artifact, [`Error::ManifestMismatch`] for a stale prebuilt manifest,
    /// [`Error::Connection`] if the store is unreachable. After: the first
    /// failure (e.g. [`Error::Upload`]), with the run sealed as failed.
    #[tracing::instrument(
        skip_all,
        fields(run_name = %publication.run_name, experiment = %self.experiment_name)
    )]
    pub async fn publish(&self, publication: Publication) -> Result<PublishedRun> {
        let Publication {
            run_name,
            params,
            metrics,
            artifact_path,
            manifest,
        } = publication;

        let size_bytes = std::fs::metadata(&artifact_path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::ArtifactMissing {
                    path: artifact_path.clone(),
                },
                _ => Error::Io(e),
            })?
            .len();
        let manifest = resolve_manifest(manifest, &artifact_path, &metrics)?;

        let experiment = self.store.get_or_create_experiment(&self.experiment_name).await?;
        let run = self.store.create_run(experiment.experiment_id(), &run_name).await?;
        let run_id = RunId::new(run.run_id());
        tracing::info!(run_id = %run_id, "run opened");

        let outcome = match self
            .fill_run(run_id.as_str(), &params, &metrics, size_bytes, &artifact_path, &manifest)
            .await
        {
            Ok(artifacts) => self
                .store
                .end_run(run_id.as_str(), RunStatus::Success)
                .await
                .map(|()| artifacts),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(artifacts) => {
                tracing::info!(run_id = %run_id, artifacts = artifacts.len(), "run sealed");
                Ok(PublishedRun {
                    run_id,
                    manifest,
                    artifacts,
                })
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %run_id,
                    error = %e,
                    "recording failed; sealing run as failed"
                );
                if let Err(seal) = self.store.end_run(run_id.as_str(), RunStatus::Failed).await {
                    tracing::error!(run_id = %run_id, error = %seal, "could not seal failed run");
                }
                Err(e)
            }
        }
    }

    async fn fill_run(
        &self,
        run_id: &str,
        params: &BTreeMap<String, String>,
        metrics: &BTreeMap<String, f64>,
        size_bytes: u64,
        artifact_path: &Path,
        manifest: &Manifest,
    ) -> Result<Vec<ArtifactRecord>> {
        self.store.log_params(run_id, params).await?;
        self.store.log_metrics(run_id, metrics).await?;
        if !metrics.contains_key(MODEL_SIZE_METRIC) {
            #[allow(clippy::cast_precision_loss)]
            let mib = size_bytes as f64 / BYTES_PER_MIB;
            self.store.log_metric(run_id, MODEL_SIZE_METRIC, mib).await?;
        }

        let scratch = tempfile::tempdir()?;
        let manifest_path = manifest.write_to(scratch.path().join(MANIFEST_FILE_NAME))?;

        let artifact = self
            .store
            .log_artifact(run_id, artifact_path, &self.artifact_subpath)
            .await?;
        let manifest_record = self
            .store
            .log_artifact(run_id, &manifest_path, &self.artifact_subpath)
            .await?;
        Ok(vec![artifact, manifest_record])
    }
}

fn resolve_manifest(
    source: ManifestSource,
    artifact_path: &Path,
    metrics: &BTreeMap<String, f64>,
) -> Result<Manifest> {
    match source {
        ManifestSource::Build { model_name, version } => {
            let metrics = metrics.iter().map(|(k, v)| (k.clone(), *v));
            Manifest::build(model_name, version, artifact_path, metrics)
        }
        ManifestSource::Prebuilt(manifest) => {
            hasher::verify(artifact_path, manifest.content_hash())?;
            Ok(manifest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::MemoryTrackingStore;

    fn artifact(dir: &Path) -> PathBuf {
        let path = dir.join("model.pte");
        std::fs::write(&path, vec![7u8; 2048]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_model_size_metric_derived() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ProvenanceRecorder::new(MemoryTrackingStore::new(), "exp");
        let publication =
            Publication::new("r", artifact(dir.path()), "M", "1.0.0").metric("top1_accuracy", 0.85);
        let run_id = recorder.record(publication).await.unwrap();

        let run = recorder.store().get_run(run_id.as_str()).await.unwrap();
        let mib = run.metrics()[MODEL_SIZE_METRIC];
        assert!((mib - 2048.0 / BYTES_PER_MIB).abs() < 1e-12);
        assert_eq!(run.status(), RunStatus::Success);
    }

    #[tokio::test]
    async fn test_caller_supplied_size_wins() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ProvenanceRecorder::new(MemoryTrackingStore::new(), "exp");
        let publication = Publication::new("r", artifact(dir.path()), "M", "1.0.0")
            .metric(MODEL_SIZE_METRIC, 3.5);
        let run_id = recorder.record(publication).await.unwrap();
        let run = recorder.store().get_run(run_id.as_str()).await.unwrap();
        assert_eq!(run.metrics()[MODEL_SIZE_METRIC], 3.5);
    }

    #[tokio::test]
    async fn test_manifest_metrics_exclude_derived_size() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ProvenanceRecorder::new(MemoryTrackingStore::new(), "exp");
        let publication =
            Publication::new("r", artifact(dir.path()), "M", "1.0.0").metric("latency_ms", 25.0);
        let published = recorder.publish(publication).await.unwrap();
        assert_eq!(published.manifest.metrics().len(), 1);
        assert_eq!(published.artifacts[1].key(), "model_files/manifest.json");
    }

    #[tokio::test]
    async fn test_custom_subpath() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ProvenanceRecorder::new(MemoryTrackingStore::new(), "exp")
            .with_artifact_subpath("release");
        let published = recorder
            .publish(Publication::new("r", artifact(dir.path()), "M", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(published.artifacts[0].key(), "release/model.pte");
    }
}
