//! Experiment Tracking
//!
//! Schema records, the [`TrackingStore`] protocol, and two stores: an
//! in-process [`MemoryTrackingStore`] and an [`MlflowClient`] for a remote
//! MLflow server.
//!
//! ## Schema Overview
//!
//! ```text
//! ExperimentRecord (1) ──< RunRecord (N)
//!                              │
//!                              ├── params  (write-once per key)
//!                              ├──< MetricRecord (N)
//!                              └──< ArtifactRecord (N) [CAS, per-run namespace]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use modelpack::tracking::{MemoryTrackingStore, RunStatus, TrackingStore};
//!
//! # async fn example() -> modelpack::Result<()> {
//! let store = MemoryTrackingStore::new();
//! let experiment = store.get_or_create_experiment("mobilenet").await?;
//! let run = store.create_run(experiment.experiment_id(), "nightly").await?;
//! store.log_param(run.run_id(), "quantization_type", "PTQ_Int8").await?;
//! store.log_metric(run.run_id(), "top1_accuracy", 0.85).await?;
//! store.end_run(run.run_id(), RunStatus::Success).await?;
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
mod artifact_record;
mod config;
mod experiment_record;
mod memory;
mod metric_record;
mod mlflow;
mod run_record;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use artifact_record::{artifact_key, ArtifactRecord};
pub use config::{
    TrackingConfig, TransportConfig, DEFAULT_ACCESS_KEY_ID, DEFAULT_EXPERIMENT,
    DEFAULT_S3_ENDPOINT_URL, DEFAULT_SECRET_ACCESS_KEY, DEFAULT_TRACKING_URI, ENV_ACCESS_KEY_ID,
    ENV_EXPERIMENT, ENV_S3_ENDPOINT_URL, ENV_SECRET_ACCESS_KEY, ENV_TRACKING_URI,
};
pub use experiment_record::ExperimentRecord;
pub use memory::MemoryTrackingStore;
pub use metric_record::MetricRecord;
pub use mlflow::MlflowClient;
pub use run_record::{RunRecord, RunRecordBuilder, RunStatus};

use crate::Result;

/// Default subpath for published files inside a run's artifact namespace.
pub const DEFAULT_ARTIFACT_SUBPATH: &str = "model_files";

/// Identifier of a recorded run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Wrap a store-assigned identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Experiment tracking protocol.
///
/// Implementations must:
/// - create experiments idempotently by name,
/// - give every run a fresh identifier and its own artifact namespace,
/// - reject a second write of the same param or metric key in one run,
/// - reject every mutation of a sealed run,
/// - surface an unreachable backend as [`crate::Error::Connection`].
pub trait TrackingStore: Send + Sync {
    /// Look up an experiment by name, creating it if absent.
    fn get_or_create_experiment(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<ExperimentRecord>> + Send;

    /// Open a new run in `Running` state.
    fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
    ) -> impl Future<Output = Result<RunRecord>> + Send;

    /// Log one param.
    fn log_param(
        &self,
        run_id: &str,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Log one metric.
    fn log_metric(
        &self,
        run_id: &str,
        key: &str,
        value: f64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Upload a local file to `<run artifact namespace>/<subpath>/<file name>`.
    fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        subpath: &str,
    ) -> impl Future<Output = Result<ArtifactRecord>> + Send;

    /// Seal a run with a terminal status.
    fn end_run(&self, run_id: &str, status: RunStatus) -> impl Future<Output = Result<()>> + Send;

    /// Fetch a run with its params and metrics.
    fn get_run(&self, run_id: &str) -> impl Future<Output = Result<RunRecord>> + Send;

    /// Log several params in key order.
    fn log_params(
        &self,
        run_id: &str,
        params: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            for (key, value) in params {
                self.log_param(run_id, key, value).await?;
            }
            Ok(())
        }
    }

    /// Log several metrics in key order.
    fn log_metrics(
        &self,
        run_id: &str,
        metrics: &BTreeMap<String, f64>,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            for (key, value) in metrics {
                self.log_metric(run_id, key, *value).await?;
            }
            Ok(())
        }
    }
}
