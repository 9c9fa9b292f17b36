//! Error types for modelpack
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Compilation pipeline stage.
///
/// Also used as the pipeline's current-state marker, see
/// [`crate::compiler::Pipeline::stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Stage {
    /// Capture a frozen graph from an evaluation-mode model.
    Export,
    /// Partition operators across backends and lower to a program.
    Lower,
    /// Write the program to a versioned container file.
    Serialize,
    /// Reload and execute the written artifact.
    Validate,
    /// All stages succeeded.
    Done,
    /// A stage failed; no later stage runs.
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Export => "export",
            Self::Lower => "lower",
            Self::Serialize => "serialize",
            Self::Validate => "validate",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// modelpack error types
#[derive(Error, Debug)]
pub enum Error {
    /// Input file does not exist
    #[error("File not found: {}", path.display())]
    NotFound {
        /// Path that was looked up
        path: PathBuf,
    },

    /// Artifact to publish is absent; nothing was recorded
    #[error("Artifact not found: {}\nBuild the model before publishing", path.display())]
    ArtifactMissing {
        /// Artifact path
        path: PathBuf,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Export stage could not trace the model
    #[error("Export failed: {0}\nOnly evaluation-mode models with static control flow can be exported")]
    Export(String),

    /// Lowering stage produced no executable program
    #[error("Lowering failed: {0}")]
    Lowering(String),

    /// Serialize stage could not write the artifact
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Validate stage rejected the reloaded artifact
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Runtime execution of a loaded method failed
    #[error("Runtime execution failed: {0}")]
    Runtime(String),

    /// Artifact bytes no longer match the recorded digest
    #[error("Content hash mismatch for {}\nExpected: {expected}\nActual: {actual}\nThe artifact is stale or corrupted; rebuild it before publishing", path.display())]
    ManifestMismatch {
        /// Artifact path
        path: PathBuf,
        /// Digest recorded in the manifest
        expected: String,
        /// Digest of the bytes currently on disk
        actual: String,
    },

    /// Param or metric key written twice in one run
    #[error("Duplicate {kind} key '{key}' in run {run_id}\nParams and metrics are write-once per run")]
    DuplicateKey {
        /// "param" or "metric"
        kind: &'static str,
        /// Offending key
        key: String,
        /// Run that already holds the key
        run_id: String,
    },

    /// Attempt to mutate a run that has already been sealed
    #[error("Run {0} is sealed and can no longer be modified")]
    RunSealed(String),

    /// Run id unknown to the tracking store
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Tracking store unreachable or timed out
    #[error("Tracking store connection failed: {0}\nCheck MLFLOW_TRACKING_URI and that the server is running")]
    Connection(String),

    /// Artifact bytes could not be transferred
    #[error("Artifact upload failed: {0}")]
    Upload(String),

    /// Tracking store rejected a request
    #[error("Tracking store error: {0}")]
    Tracking(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background worker task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl Error {
    /// Compilation stage that produced this error, if any.
    ///
    /// Runtime failures surface from the validate stage.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Export(_) => Some(Stage::Export),
            Self::Lowering(_) => Some(Stage::Lower),
            Self::Serialization(_) => Some(Stage::Serialize),
            Self::Validation(_) | Self::Runtime(_) => Some(Stage::Validate),
            _ => None,
        }
    }

    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }
}
