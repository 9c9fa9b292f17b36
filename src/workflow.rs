//! Build-and-publish workflow
//!
//! Glue shared by the binaries: where the artifact lives, what a publish
//! records by default, and how outcomes map to process exit codes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::compiler::container;
use crate::compiler::program::Executor;
use crate::provenance::{ProvenanceRecorder, Publication, PublishedRun};
use crate::tracking::TrackingStore;
use crate::{Error, Result};

/// Artifact published by default.
pub const DEFAULT_MODEL_FILE: &str = "app/src/main/assets/mv2_xnnpack.pte";
/// Registered model name.
pub const DEFAULT_MODEL_NAME: &str = "PersonDetectionQuantized";
/// Manifest version.
pub const DEFAULT_VERSION: &str = "1.0.0";
/// Run name (not unique; every publish opens a fresh run).
pub const DEFAULT_RUN_NAME: &str = "quantized_model_v1";
/// Artifact written by the build binary.
pub const DEFAULT_BUILD_OUTPUT: &str = "mv2_xnnpack.pte";

/// Artifact path override.
pub const ENV_MODEL_FILE: &str = "MODELPACK_MODEL_FILE";
/// Comma-separated `key=value` metrics measured outside this tool.
pub const ENV_METRICS: &str = "MODELPACK_METRICS";
/// Build output override.
pub const ENV_OUTPUT: &str = "MODELPACK_OUTPUT";

/// Process exit status of the binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Everything succeeded
    Success,
    /// The input artifact was missing; nothing was recorded
    InputMissing,
    /// Any other failure
    Failed,
}

impl ExitStatus {
    /// Numeric exit code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::InputMissing => 1,
            Self::Failed => 2,
        }
    }

    /// Exit status for a failed publish.
    ///
    /// Only an artifact found missing before anything was recorded maps to
    /// [`ExitStatus::InputMissing`]; a file vanishing mid-publish is a
    /// generic failure.
    #[must_use]
    pub const fn for_error(error: &Error) -> Self {
        match error {
            Error::ArtifactMissing { .. } => Self::InputMissing,
            _ => Self::Failed,
        }
    }
}

/// What a publish records.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    /// Artifact to publish
    pub model_file: PathBuf,
    /// Registered model name
    pub model_name: String,
    /// Manifest version
    pub version: String,
    /// Run name
    pub run_name: String,
    /// Extra params merged over the ones derived from the artifact
    pub params: BTreeMap<String, String>,
    /// Externally measured metrics
    pub metrics: BTreeMap<String, f64>,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            model_file: PathBuf::from(DEFAULT_MODEL_FILE),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            version: DEFAULT_VERSION.to_string(),
            run_name: DEFAULT_RUN_NAME.to_string(),
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }
}

impl PublishSettings {
    /// Read overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a malformed metrics list.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a malformed metrics list.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(file) = lookup(ENV_MODEL_FILE).filter(|v| !v.trim().is_empty()) {
            settings.model_file = PathBuf::from(file);
        }
        if let Some(list) = lookup(ENV_METRICS) {
            settings.metrics = parse_metrics(&list)?;
        }
        Ok(settings)
    }
}

/// Parse `key=value[,key=value...]`.
///
/// # Errors
///
/// Returns [`Error::Config`] for an entry without `=`, an empty key or a
/// value that is not a finite number.
pub fn parse_metrics(list: &str) -> Result<BTreeMap<String, f64>> {
    let mut metrics = BTreeMap::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            Error::Config(format!("{ENV_METRICS}: expected key=value, got '{entry}'"))
        })?;
        let key = key.trim();
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{ENV_METRICS}: '{value}' is not a number")))?;
        if key.is_empty() || !value.is_finite() {
            return Err(Error::Config(format!("{ENV_METRICS}: invalid entry '{entry}'")));
        }
        metrics.insert(key.to_string(), value);
    }
    Ok(metrics)
}

/// Confirm the artifact exists before anything else happens.
///
/// # Errors
///
/// Returns [`Error::ArtifactMissing`] if `path` is not an existing file.
pub fn check_artifact(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::ArtifactMissing {
            path: path.to_path_buf(),
        })
    }
}

/// Params describing a program container, read from its contents.
///
/// Files that are not readable containers yield no params.
#[must_use]
pub fn artifact_params(path: &Path) -> BTreeMap<String, String> {
    let program = match container::read(path) {
        Ok(program) => program,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "artifact is not a readable program container"
            );
            return BTreeMap::new();
        }
    };
    let backends: std::collections::BTreeSet<&str> = program
        .methods
        .iter()
        .flat_map(|m| m.segments.iter())
        .filter_map(|s| match &s.executor {
            Executor::Delegate { backend } => Some(backend.as_str()),
            Executor::Portable => None,
        })
        .collect();
    let backend = if backends.is_empty() {
        "portable".to_string()
    } else {
        backends.into_iter().collect::<Vec<_>>().join(",")
    };
    BTreeMap::from([
        ("base_model".to_string(), program.model_name.clone()),
        ("quantization_type".to_string(), program.quantization.to_string()),
        ("delegate_backend".to_string(), backend),
    ])
}

/// Publish `settings.model_file` through `recorder`.
///
/// # Errors
///
/// Returns [`Error::ArtifactMissing`] before any run is opened if the artifact is
/// missing; otherwise see [`ProvenanceRecorder::publish`].
pub async fn publish<S: TrackingStore>(
    recorder: &ProvenanceRecorder<S>,
    settings: PublishSettings,
) -> Result<PublishedRun> {
    check_artifact(&settings.model_file)?;

    let mut params = artifact_params(&settings.model_file);
    params.extend(settings.params);
    let publication = Publication::new(
        settings.run_name,
        settings.model_file,
        settings.model_name,
        settings.version,
    )
    .params(params);
    let publication = settings
        .metrics
        .into_iter()
        .fold(publication, |p, (k, v)| p.metric(k, v));

    recorder.publish(publication).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::for_error(&Error::Upload("x".into())).code(), 2);
    }

    #[test]
    fn test_only_preflight_miss_is_input_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_artifact(&dir.path().join("absent.pte")).unwrap_err();
        assert_eq!(ExitStatus::for_error(&err), ExitStatus::InputMissing);
        assert_eq!(ExitStatus::for_error(&err).code(), 1);
        // a file lost after the run was opened surfaces as a plain NotFound
        assert_eq!(ExitStatus::for_error(&Error::not_found("x")), ExitStatus::Failed);
    }

    #[test]
    fn test_parse_metrics() {
        let m = parse_metrics("top1_accuracy=0.85, inference_latency_ms=25").unwrap();
        assert_eq!(m["top1_accuracy"], 0.85);
        assert_eq!(m["inference_latency_ms"], 25.0);
        assert!(parse_metrics("").unwrap().is_empty());
        assert!(parse_metrics("acc").is_err());
        assert!(parse_metrics("acc=high").is_err());
        assert!(parse_metrics("acc=inf").is_err());
    }

    #[test]
    fn test_settings_from_lookup() {
        let settings = PublishSettings::from_lookup(|k| match k {
            ENV_MODEL_FILE => Some("/tmp/m.pte".to_string()),
            ENV_METRICS => Some("acc=0.5".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(settings.model_file, PathBuf::from("/tmp/m.pte"));
        assert_eq!(settings.metrics["acc"], 0.5);
        assert_eq!(settings.run_name, DEFAULT_RUN_NAME);
    }

    #[test]
    fn test_artifact_params_for_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.pte");
        std::fs::write(&path, b"not a container").unwrap();
        assert!(artifact_params(&path).is_empty());
    }
}
