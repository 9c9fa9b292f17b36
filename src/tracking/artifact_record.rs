//! Uploaded run files, identified by content

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hasher;
use crate::Result;

/// A file uploaded into a run's artifact namespace.
///
/// `cas_hash` is `algorithm:hex_digest`, e.g.
/// `sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    run_id: String,
    key: String,
    cas_hash: String,
    size_bytes: u64,
    created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    /// Record for `key` (e.g. `model_files/model.pte`) in `run_id`.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        key: impl Into<String>,
        cas_hash: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            key: key.into(),
            cas_hash: cas_hash.into(),
            size_bytes,
            created_at: Utc::now(),
        }
    }

    /// Describe a local file about to be stored under `key`.
    ///
    /// # Errors
    ///
    /// Propagates [`hasher::digest`] failures.
    pub fn from_file(
        run_id: impl Into<String>,
        key: impl Into<String>,
        path: &Path,
    ) -> Result<Self> {
        let digest = hasher::digest(path)?;
        let size_bytes = std::fs::metadata(path)?.len();
        Ok(Self::new(run_id, key, format!("sha256:{digest}"), size_bytes))
    }

    /// Owning run.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Key inside the run's artifact namespace.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `sha256:<hex>` of the uploaded bytes.
    #[must_use]
    pub fn cas_hash(&self) -> &str {
        &self.cas_hash
    }

    /// Uploaded size in bytes
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Upload time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Join a subpath and a file name into an artifact key.
#[must_use]
pub fn artifact_key(subpath: &str, file_name: &str) -> String {
    let subpath = subpath.trim_matches('/');
    if subpath.is_empty() {
        file_name.to_string()
    } else {
        format!("{subpath}/{file_name}")
    }
}
