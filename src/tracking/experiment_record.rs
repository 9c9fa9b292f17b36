//! Experiment: a named grouping of runs that owns an artifact root

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked experiment.
///
/// Stores resolve experiments by name and create them on first use, so two
/// publishes into the same experiment name always land side by side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentRecord {
    experiment_id: String,
    name: String,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact_location: Option<String>,
}

impl ExperimentRecord {
    /// Experiment created now, without a known artifact root.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            name: name.into(),
            created_at: Utc::now(),
            artifact_location: None,
        }
    }

    /// Attach the root URI runs of this experiment store artifacts under.
    #[must_use]
    pub fn with_artifact_location(mut self, location: impl Into<String>) -> Self {
        self.artifact_location = Some(location.into());
        self
    }

    /// Replace the creation time with one reported by the server.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Store-assigned identifier.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Experiment name, unique per tracking server
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time the experiment was first created
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Artifact root, if the store reported one.
    #[must_use]
    pub fn artifact_location(&self) -> Option<&str> {
        self.artifact_location.as_deref()
    }
}
