//! Error types for coursesmith.
//!
//! Library crates use [`CourseError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all coursesmith operations.
#[derive(Debug, thiserror::Error)]
pub enum CourseError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// User input incomplete or inconsistent. Never reaches the model backend.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Reference material unreadable or document index build failed.
    #[error("ingestion error: {0}")]
    Ingestion(String),

    /// The model backend reported a failed or expired run, or the transport failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// The conversation holds no assistant-authored message after a completed run.
    #[error("no response from the model for stage {stage}")]
    NoResponse { stage: String },

    /// Model output could not be coerced into the expected shape.
    #[error("unparseable response: {message}")]
    Normalization {
        message: String,
        /// Raw model text, kept for diagnostics.
        raw: String,
        /// Rendered excerpt pinpointing the parse failure, when available.
        excerpt: Option<String>,
    },

    /// The backend did not reach a terminal status within the configured limit.
    #[error("stage {stage} timed out after {}s", elapsed.as_secs())]
    StageTimeout { stage: String, elapsed: Duration },

    /// The wait for a stage was cancelled by the caller.
    #[error("stage {stage} was cancelled")]
    Cancelled { stage: String },

    /// A generation step is already unresolved for this run.
    #[error("a {stage} request is already in flight")]
    StageInFlight { stage: String },

    /// Another process holds the run's lease.
    #[error("run {run} is busy: {holder} has been working on it since {since}")]
    RunBusy {
        run: String,
        holder: String,
        since: String,
    },

    /// The requested control signal is not valid in the current stage.
    #[error("cannot {action} while in stage {stage}")]
    InvalidTransition { action: String, stage: String },

    /// A referenced entity (run, lesson, quiz) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CourseError>;

/// Coarse classification of an error, matching what the user is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Ingestion,
    Backend,
    Normalization,
    Control,
    Environment,
}

impl CourseError {
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

    /// Create a normalization error that carries the offending raw text.
    pub fn normalization(msg: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Normalization {
            message: msg.into(),
            raw: raw.into(),
            excerpt: None,
        }
    }

    /// Create an invalid-transition error.
    pub fn transition(action: impl Into<String>, stage: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            action: action.into(),
            stage: stage.to_string(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify the error for user-facing reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Ingestion(_) => ErrorKind::Ingestion,
            Self::Backend(_)
            | Self::NoResponse { .. }
            | Self::StageTimeout { .. }
            | Self::Cancelled { .. } => ErrorKind::Backend,
            Self::Normalization { .. } => ErrorKind::Normalization,
            Self::StageInFlight { .. }
            | Self::RunBusy { .. }
            | Self::InvalidTransition { .. }
            | Self::NotFound(_) => ErrorKind::Control,
            Self::Config { .. } | Self::Storage(_) | Self::Io { .. } => ErrorKind::Environment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CourseError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = CourseError::validation("language is required");
        assert!(err.to_string().contains("language is required"));

        let err = CourseError::StageTimeout {
            stage: "sections".into(),
            elapsed: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "stage sections timed out after 30s");
    }

    #[test]
    fn normalization_error_keeps_raw_text() {
        let err = CourseError::normalization("no JSON found", "I could not do that");
        match err {
            CourseError::Normalization { raw, excerpt, .. } => {
                assert_eq!(raw, "I could not do that");
                assert!(excerpt.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(CourseError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(CourseError::Backend("run failed".into()).kind(), ErrorKind::Backend);
        assert_eq!(
            CourseError::NoResponse {
                stage: "overview".into()
            }
            .kind(),
            ErrorKind::Backend
        );
        assert_eq!(CourseError::normalization("x", "y").kind(), ErrorKind::Normalization);
        assert_eq!(CourseError::transition("confirm", "intake").kind(), ErrorKind::Control);
    }
}
