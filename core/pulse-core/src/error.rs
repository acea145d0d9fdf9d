//! Error types for pulse-core operations.

use std::path::PathBuf;

/// All errors that can occur in pulse-core operations.
///
/// Reads of the state snapshot never produce one of these (absent or corrupt
/// state is valid initial state); writes, configuration and account files do.
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("State file path has no parent directory: {0}")]
    NoParentDir(PathBuf),

    #[error("Failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PulseError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PulseError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        PulseError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using PulseError.
pub type Result<T> = std::result::Result<T, PulseError>;

impl From<PulseError> for String {
    fn from(err: PulseError) -> String {
        err.to_string()
    }
}
