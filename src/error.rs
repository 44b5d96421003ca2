use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::flagset::ValueType;

/// Result type used throughout the crate. The error variant is the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by connectors and lifecycle operations.
///
/// Per-evaluation failures are reported separately as [`EvaluationError`];
/// everything in this enum concerns synchronization and resource management.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Error evaluating a flag.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    /// The sync source produced a document that failed to parse. Carries the
    /// parser's message. Connectors report this on the event bus and keep
    /// serving the last good snapshot.
    #[error("invalid flag configuration: {0}")]
    InvalidConfiguration(String),

    /// Initialization deadline elapsed before the first successful sync. The
    /// connector keeps retrying in the background.
    #[error("sync source not ready within {0:?}")]
    InitializationTimeout(std::time::Duration),

    /// Indicates that the connector background thread panicked. This should
    /// normally never happen.
    #[error("connector thread panicked")]
    ConnectorPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// gRPC transport error.
    #[error(transparent)]
    Transport(Arc<tonic::transport::Error>),

    /// gRPC call failed.
    #[error(transparent)]
    Status(Box<tonic::Status>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(value: tonic::transport::Error) -> Self {
        Self::Transport(Arc::new(value))
    }
}

impl From<tonic::Status> for Error {
    fn from(value: tonic::Status) -> Self {
        Self::Status(Box::new(value))
    }
}

/// Errors that can occur while resolving a single flag.
///
/// These are deterministic per-call conditions: the resolver reports them
/// immediately and never retries. The caller decides whether to fall back to
/// its own default value.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The requested flag key is absent from the current snapshot.
    #[error("flag not found: {key}")]
    FlagNotFound {
        /// Key that was requested.
        key: String,
    },

    /// Targeting produced a malformed result: a selector that is not a
    /// string or boolean, or a variant absent from the flag's variants.
    #[error("parse error: {0}")]
    Parse(String),

    /// The resolved variant's value type does not match the requested type.
    #[error("type mismatch (expected: {expected:?}, found: {found:?})")]
    TypeMismatch {
        /// Type requested by the caller.
        expected: ValueType,
        /// Actual type of the variant value.
        found: ValueType,
    },

    /// Unexpected failure that does not fit the other categories.
    #[error("{0}")]
    General(String),
}

/// Standard error code attached to [`ResolutionResult`](crate::ResolutionResult)s
/// that carry an error reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Flag key absent from the current snapshot.
    FlagNotFound,
    /// Malformed definition, rule, or targeting result.
    ParseError,
    /// Variant value type does not match the requested type.
    TypeMismatch,
    /// Anything else.
    General,
}

impl EvaluationError {
    /// Map the error onto the standard error-code taxonomy.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            EvaluationError::FlagNotFound { .. } => ErrorCode::FlagNotFound,
            EvaluationError::Parse(_) => ErrorCode::ParseError,
            EvaluationError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            EvaluationError::General(_) => ErrorCode::General,
        }
    }
}
