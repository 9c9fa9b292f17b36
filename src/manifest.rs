//! Artifact manifest - binds an artifact's identity to its metrics
//!
//! ## JSON layout
//!
//! Field names are a compatibility contract with downstream consumers:
//!
//! ```json
//! {
//!     "model_name": "PersonDetectionQuantized",
//!     "version": "1.0.0",
//!     "sha256": "<64 lowercase hex chars>",
//!     "model_file": "app/src/main/assets/mv2_xnnpack.pte",
//!     "metrics": { "top1_accuracy": 0.85, "latency_ms": 25.0 }
//! }
//! ```
//!
//! Building a manifest only hashes the artifact. Persisting it is a separate
//! [`Manifest::write_to`] call, so the in-memory value can be inspected
//! before any I/O happens.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::hasher::{self, Digest};
use crate::{Error, Result};

/// Default file name for a persisted manifest
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Structured description of a produced artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    model_name: String,
    version: String,
    #[serde(rename = "sha256")]
    content_hash: Digest,
    #[serde(rename = "model_file")]
    artifact_path: PathBuf,
    metrics: BTreeMap<String, f64>,
}

impl Manifest {
    /// Build a manifest for the artifact at `artifact_path`.
    ///
    /// # Arguments
    ///
    /// * `model_name` - Registered model name
    /// * `version` - Semantic-version-like string (e.g. `1.0.0`, `2.1.0-rc1`)
    /// * `artifact_path` - Existing artifact file
    /// * `metrics` - Metric name to value, may be empty
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty model name, a malformed
    /// version or a non-finite metric, and propagates hasher failures
    /// unchanged.
    pub fn build<I, K>(
        model_name: impl Into<String>,
        version: impl Into<String>,
        artifact_path: impl AsRef<Path>,
        metrics: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let model_name = model_name.into();
        if model_name.trim().is_empty() {
            return Err(Error::InvalidInput("model_name must not be empty".to_string()));
        }
        let version = version.into();
        validate_version(&version)?;

        let mut collected = BTreeMap::new();
        for (key, value) in metrics {
            let key = key.into();
            if !value.is_finite() {
                return Err(Error::InvalidInput(format!(
                    "metric '{key}' must be finite, got {value}"
                )));
            }
            collected.insert(key, value);
        }

        let artifact_path = artifact_path.as_ref().to_path_buf();
        let content_hash = hasher::digest(&artifact_path)?;

        tracing::info!(
            model_name = %model_name,
            version = %version,
            sha256 = %content_hash,
            "built manifest"
        );

        Ok(Self {
            model_name,
            version,
            content_hash,
            artifact_path,
            metrics: collected,
        })
    }

    /// Get the model name.
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Get the version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get the artifact digest captured at build time.
    #[must_use]
    pub const fn content_hash(&self) -> &Digest {
        &self.content_hash
    }

    /// Get the artifact path.
    #[must_use]
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Get the recorded metrics.
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// Re-hash the artifact and check it still matches `content_hash`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestMismatch`] if the artifact changed since the
    /// manifest was built.
    pub fn verify(&self) -> Result<()> {
        hasher::verify(&self.artifact_path, &self.content_hash)
    }

    /// Pretty-printed JSON (4-space indent).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut ser)
            .map_err(|e| Error::InvalidInput(format!("manifest serialization: {e}")))?;
        String::from_utf8(out).map_err(|e| Error::InvalidInput(e.to_string()))
    }

    /// Parse a manifest from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] on malformed JSON or a bad digest.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidInput(format!("manifest: {e}")))
    }

    /// Persist the manifest as JSON at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be written.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)?;
        tracing::debug!(path = %path.display(), "wrote manifest");
        Ok(path.to_path_buf())
    }

    /// Load a manifest previously written with [`Manifest::write_to`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the file is missing.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(path),
            _ => Error::Io(e),
        })?;
        Self::from_json(&json)
    }
}

/// Accepts `MAJOR[.MINOR[.PATCH]]` with an optional `-pre` / `+build` suffix.
fn validate_version(version: &str) -> Result<()> {
    let core = version
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    let well_formed = (1..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if well_formed {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "version '{version}' is not semantic-version-like (expected e.g. 1.0.0)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn artifact(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn test_build_captures_digest() {
        let file = artifact(b"program");
        let manifest = Manifest::build("X", "1.0.0", file.path(), [("acc", 0.85)]).unwrap();
        assert_eq!(manifest.model_name(), "X");
        assert_eq!(manifest.content_hash(), &Digest::of_bytes(b"program"));
        assert!((manifest.metrics()["acc"] - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_json_field_names() {
        let file = artifact(b"program");
        let manifest = Manifest::build("X", "1.0.0", file.path(), [("acc", 0.85)]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["metrics", "model_file", "model_name", "sha256", "version"]);
        assert_eq!(obj["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_version_validation() {
        assert!(validate_version("1.0.0").is_ok());
        assert!(validate_version("2.1").is_ok());
        assert!(validate_version("3.0.0-rc1").is_ok());
        assert!(validate_version("").is_err());
        assert!(validate_version("v1.0").is_err());
        assert!(validate_version("1..0").is_err());
        assert!(validate_version("1.2.3.4").is_err());
    }

    #[test]
    fn test_rejects_non_finite_metric() {
        let file = artifact(b"program");
        let err = Manifest::build("X", "1.0.0", file.path(), [("acc", f64::NAN)]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
