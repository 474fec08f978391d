//! Error types for memforge.
//!
//! Library crates use [`MemforgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::StageKind;

/// Top-level error type for all memforge operations.
#[derive(Debug, thiserror::Error)]
pub enum MemforgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (empty batch, malformed name, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// An uploaded file is not valid UTF-8 and the intake policy rejects it.
    #[error("upload '{name}' is not valid UTF-8 text")]
    Decode { name: String },

    /// Building the combined document failed; no stage was started.
    #[error("aggregation failed: {source}")]
    Aggregation {
        #[source]
        source: Box<MemforgeError>,
    },

    /// The stage processor could not be launched at all.
    #[error("failed to launch {stage} processor `{program}`: {source}")]
    Spawn {
        stage: StageKind,
        program: String,
        source: std::io::Error,
    },

    /// The stage processor ran and exited unsuccessfully.
    #[error("error {} ({}):\n{diagnostics}", stage.describe(), exit_label(*exit_code))]
    StageFailed {
        stage: StageKind,
        exit_code: Option<i32>,
        diagnostics: String,
    },

    /// The stage processor exceeded its wall-clock budget and was killed.
    /// `diagnostics` holds whatever it wrote to stderr before that.
    #[error("{stage} stage timed out after {after:?} and was terminated:\n{diagnostics}")]
    Timeout {
        stage: StageKind,
        after: Duration,
        diagnostics: String,
    },

    /// The requested artifact does not exist.
    #[error("artifact not found: {id}")]
    NotFound { id: String },

    /// The artifact identifier is malformed or escapes the scratch store.
    #[error("invalid artifact id '{id}': {reason}")]
    InvalidArtifactId { id: String, reason: String },
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MemforgeError>;

impl MemforgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap an intake error so the message names aggregation as the failing step.
    pub fn aggregation(source: MemforgeError) -> Self {
        Self::Aggregation {
            source: Box::new(source),
        }
    }

    pub fn invalid_artifact_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArtifactId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// True for a retrieval miss, as opposed to an internal I/O failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The pipeline stage responsible for this error, if any.
    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            Self::Spawn { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
