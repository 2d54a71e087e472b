//! Error types for loadctl.
//!
//! Library crates use [`LoadCtlError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::{ExecutionId, SourceId};

/// Top-level error type for all control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum LoadCtlError {
    /// No active source with this id.
    #[error("source {0} not found")]
    ConfigNotFound(SourceId),

    /// Registration collided with an existing source name.
    #[error("a source named '{0}' is already registered")]
    DuplicateSourceName(String),

    /// Source or request parameters are inconsistent.
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    /// The stored watermark moved since the caller last read it.
    #[error(
        "watermark {column} of source {source_id} changed concurrently: expected {}, found {}",
        .expected.as_deref().unwrap_or("<none>"),
        .actual.as_deref().unwrap_or("<none>")
    )]
    WatermarkRaceCondition {
        source_id: SourceId,
        column: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// A monotonic watermark was asked to move backwards.
    #[error(
        "watermark {column} of source {source_id} cannot move back from '{current}' to '{attempted}'"
    )]
    WatermarkRegression {
        source_id: SourceId,
        column: String,
        current: String,
        attempted: String,
    },

    /// `end_run` target is missing or already terminal.
    #[error("execution {0} is unknown or already completed")]
    UnknownExecutionId(ExecutionId),

    /// Storage-level referential or check constraint failure.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration file loading error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A stored or supplied value could not be decoded.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LoadCtlError>;

impl LoadCtlError {
    /// Create an invalid-config error from any displayable message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: msg.into(),
        }
    }

    /// Create a config-file error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LoadCtlError::invalid("merge key required");
        assert_eq!(err.to_string(), "invalid config: merge key required");

        let err = LoadCtlError::ConfigNotFound(SourceId(7));
        assert_eq!(err.to_string(), "source 7 not found");
    }

    #[test]
    fn race_condition_shows_missing_values() {
        let err = LoadCtlError::WatermarkRaceCondition {
            source_id: SourceId(1),
            column: "updated_at".into(),
            expected: None,
            actual: Some("2024-02-01".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("expected <none>"));
        assert!(msg.contains("found 2024-02-01"));
    }
}
