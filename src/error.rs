//! Error types for the storage plugin
//!
//! Every failure surfaced to the orchestrator carries a stable status
//! [`Code`]. Array gateway clients classify backend failures into an
//! [`ArrayErrorKind`] once, so the controller never inspects message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Status Codes
// =============================================================================

/// Externally visible status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Ok,
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Array Error Classification
// =============================================================================

/// Classification of a failure reported by the storage array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayErrorKind {
    /// The addressed object does not exist
    NotFound,
    /// The identifier is not in the array's ID format
    MalformedId,
    /// Another object already uses the requested name
    NameInUse,
    /// A removal of the object is already under way
    RemovalInProgress,
    /// Session token missing, expired or rejected
    Unauthorized,
    /// Anything else
    Other,
}

impl std::fmt::Display for ArrayErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArrayErrorKind::NotFound => write!(f, "not found"),
            ArrayErrorKind::MalformedId => write!(f, "malformed id"),
            ArrayErrorKind::NameInUse => write!(f, "name in use"),
            ArrayErrorKind::RemovalInProgress => write!(f, "removal in progress"),
            ArrayErrorKind::Unauthorized => write!(f, "unauthorized"),
            ArrayErrorKind::Other => write!(f, "array error"),
        }
    }
}

// =============================================================================
// Error
// =============================================================================

/// Unified error type for the plugin
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    Aborted(String),

    #[error("{0}")]
    Unimplemented(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Array Errors
    // =========================================================================
    #[error("array {kind}: {message}")]
    Array {
        kind: ArrayErrorKind,
        message: String,
    },

    #[error("Array connection error: {0}")]
    ArrayConnection(#[from] reqwest::Error),

    // =========================================================================
    // Host Errors
    // =========================================================================
    #[error("Mount operation failed on {path}: {reason}")]
    Mount { path: String, reason: String },

    #[error("Host command {command} failed: {reason}")]
    HostCommand { command: String, reason: String },

    #[error("System call failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an array failure of the given kind
    pub fn array(kind: ArrayErrorKind, message: impl Into<String>) -> Self {
        Error::Array {
            kind,
            message: message.into(),
        }
    }

    /// The array classification, if this error came from the array
    pub fn array_kind(&self) -> Option<ArrayErrorKind> {
        match self {
            Error::Array { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True when the array says the object does not exist, or the ID could
    /// never name an object
    pub fn is_array_not_found(&self) -> bool {
        matches!(
            self.array_kind(),
            Some(ArrayErrorKind::NotFound) | Some(ArrayErrorKind::MalformedId)
        )
    }

    /// Status code reported to the orchestrator
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::OutOfRange(_) => Code::OutOfRange,
            Error::NotFound(_) => Code::NotFound,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::FailedPrecondition(_) => Code::FailedPrecondition,
            Error::Aborted(_) => Code::Aborted,
            Error::Unimplemented(_) => Code::Unimplemented,
            Error::Unavailable(_) => Code::Unavailable,
            Error::Cancelled(_) => Code::Cancelled,
            Error::DeadlineExceeded(_) => Code::DeadlineExceeded,

            Error::Array { kind, .. } => match kind {
                ArrayErrorKind::NotFound | ArrayErrorKind::MalformedId => Code::NotFound,
                _ => Code::Internal,
            },

            Error::ArrayConnection(_) => Code::Unavailable,

            Error::Internal(_)
            | Error::Configuration(_)
            | Error::Mount { .. }
            | Error::HostCommand { .. }
            | Error::Errno(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Io(_) => Code::Internal,
        }
    }

    /// Check if the caller may usefully retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            Code::Unavailable | Code::Aborted | Code::DeadlineExceeded | Code::Internal
        ) && !matches!(self, Error::Configuration(_))
    }
}

/// Result type alias for the plugin
pub type Result<T> = std::result::Result<T, Error>;
