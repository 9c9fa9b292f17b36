//! Run Record - one recording session
//!
//! A run is open while `Pending`/`Running` and sealed once it reaches a
//! terminal status. Params and metrics are write-once per key, and a sealed
//! run rejects every mutation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run is created but not yet started.
    Pending,
    /// Run is currently executing.
    Running,
    /// Run completed successfully.
    Success,
    /// Run failed with an error.
    Failed,
    /// Run was cancelled by user or system.
    Cancelled,
}

impl RunStatus {
    /// Whether this status seals the run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// MLflow wire name.
    #[must_use]
    pub const fn as_mlflow(self) -> &'static str {
        match self {
            Self::Pending => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Success => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "KILLED",
        }
    }

    /// Parse an MLflow wire name.
    #[must_use]
    pub fn from_mlflow(status: &str) -> Option<Self> {
        match status {
            "SCHEDULED" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "FINISHED" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "KILLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Run Record represents a single recording session of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    run_id: String,
    experiment_id: String,
    run_name: String,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    artifact_uri: Option<String>,
    params: BTreeMap<String, String>,
    metrics: BTreeMap<String, f64>,
}

impl RunRecord {
    /// Create a new run record in Pending status.
    #[must_use]
    pub fn new(run_id: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        Self::builder(run_id, experiment_id).build()
    }

    /// Create a builder for constructing a run record with optional fields.
    #[must_use]
    pub fn builder(
        run_id: impl Into<String>,
        experiment_id: impl Into<String>,
    ) -> RunRecordBuilder {
        RunRecordBuilder::new(run_id, experiment_id)
    }

    /// Get the run ID.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Get the parent experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the human-readable run name (not unique).
    #[must_use]
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// Get the current run status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Get the start timestamp, if the run has started.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get the end timestamp, if the run has been sealed.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Root URI of this run's own artifact namespace.
    #[must_use]
    pub fn artifact_uri(&self) -> Option<&str> {
        self.artifact_uri.as_deref()
    }

    /// Logged params.
    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Logged metrics.
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// Whether the run reached a terminal status.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Start the run, transitioning from Pending to Running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunSealed`] if the run is already sealed.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record a param.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunSealed`] for a sealed run and
    /// [`Error::DuplicateKey`] if `key` was already logged.
    pub fn insert_param(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        let key = key.into();
        if self.params.contains_key(&key) {
            return Err(self.duplicate("param", key));
        }
        self.params.insert(key, value.into());
        Ok(())
    }

    /// Record a metric.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunSealed`] for a sealed run,
    /// [`Error::DuplicateKey`] if `key` was already logged and
    /// [`Error::InvalidInput`] for a non-finite value.
    pub fn insert_metric(&mut self, key: impl Into<String>, value: f64) -> Result<()> {
        self.ensure_open()?;
        let key = key.into();
        if !value.is_finite() {
            return Err(Error::InvalidInput(format!("metric '{key}' is not finite: {value}")));
        }
        if self.metrics.contains_key(&key) {
            return Err(self.duplicate("metric", key));
        }
        self.metrics.insert(key, value);
        Ok(())
    }

    /// Seal the run with a terminal `status`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunSealed`] if already sealed and
    /// [`Error::InvalidInput`] for a non-terminal status.
    pub fn seal(&mut self, status: RunStatus) -> Result<()> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "cannot seal run {} with non-terminal status {status:?}",
                self.run_id
            )));
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Fail with [`Error::RunSealed`] if the run is sealed.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::RunSealed(self.run_id.clone()));
        }
        Ok(())
    }

    fn duplicate(&self, kind: &'static str, key: String) -> Error {
        Error::DuplicateKey {
            kind,
            key,
            run_id: self.run_id.clone(),
        }
    }
}

/// Builder for `RunRecord`.
#[derive(Debug)]
pub struct RunRecordBuilder {
    run_id: String,
    experiment_id: String,
    run_name: Option<String>,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    artifact_uri: Option<String>,
    params: BTreeMap<String, String>,
    metrics: BTreeMap<String, f64>,
}

impl RunRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(run_id: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            experiment_id: experiment_id.into(),
            run_name: None,
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            artifact_uri: None,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Set the run name (defaults to the run ID).
    #[must_use]
    pub fn run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    /// Set the artifact namespace URI.
    #[must_use]
    pub fn artifact_uri(mut self, uri: impl Into<String>) -> Self {
        self.artifact_uri = Some(uri.into());
        self
    }

    /// Set the status (used when rebuilding a record from a store).
    #[must_use]
    pub const fn status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    /// Set start and end timestamps.
    #[must_use]
    pub const fn times(
        mut self,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.started_at = started_at;
        self.ended_at = ended_at;
        self
    }

    /// Set params already stored for the run.
    #[must_use]
    pub fn params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// Set metrics already stored for the run.
    #[must_use]
    pub fn metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Build the `RunRecord`.
    #[must_use]
    pub fn build(self) -> RunRecord {
        RunRecord {
            run_name: self.run_name.unwrap_or_else(|| self.run_id.clone()),
            run_id: self.run_id,
            experiment_id: self.experiment_id,
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            artifact_uri: self.artifact_uri,
            params: self.params,
            metrics: self.metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_default() {
        let run = RunRecord::new("run-1", "exp-1");
        assert_eq!(run.status(), RunStatus::Pending);
        assert_eq!(run.run_name(), "run-1");
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = RunRecord::new("run-1", "exp-1");
        run.start().unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        run.seal(RunStatus::Success).unwrap();
        assert!(run.is_sealed());
        assert!(run.ended_at().is_some());
    }

    #[test]
    fn test_sealed_run_is_immutable() {
        let mut run = RunRecord::new("run-1", "exp-1");
        run.start().unwrap();
        run.insert_param("base_model", "MobileNetV2").unwrap();
        run.seal(RunStatus::Failed).unwrap();

        assert!(matches!(run.insert_param("x", "y"), Err(Error::RunSealed(_))));
        assert!(matches!(run.insert_metric("acc", 0.5), Err(Error::RunSealed(_))));
        assert!(matches!(run.seal(RunStatus::Success), Err(Error::RunSealed(_))));
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.params()["base_model"], "MobileNetV2");
    }

    #[test]
    fn test_duplicate_param_keeps_first_value() {
        let mut run = RunRecord::new("run-1", "exp-1");
        run.insert_param("k", "a").unwrap();
        let err = run.insert_param("k", "b").unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { kind: "param", .. }));
        assert_eq!(run.params()["k"], "a");
    }

    #[test]
    fn test_seal_requires_terminal_status() {
        let mut run = RunRecord::new("run-1", "exp-1");
        assert!(matches!(run.seal(RunStatus::Running), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_mlflow_status_names() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::from_mlflow(status.as_mlflow()), Some(status));
        }
        assert_eq!(RunStatus::from_mlflow("bogus"), None);
    }
}
