use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    #[error(
        "Revision conflict on {kind} '{id}': expected revision {expected}, found {}",
        actual.map(|rev| rev.to_string()).unwrap_or_else(|| "none".to_string())
    )]
    RevisionConflict {
        kind: String,
        id: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("Business rule violation: {0}")]
    BusinessRuleViolation(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Coarse classification of an [`EngineError`], used by callers that decide
/// whether to retry, skip, or surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IllegalArgument,
    NotFound,
    RevisionConflict,
    BusinessRuleViolation,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::IllegalArgument => "illegal_argument",
            Self::NotFound => "not_found",
            Self::RevisionConflict => "revision_conflict",
            Self::BusinessRuleViolation => "business_rule_violation",
            Self::Fatal => "fatal",
        };
        write!(f, "{label}")
    }
}

impl EngineError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn conflict(
        kind: impl Into<String>,
        id: impl Into<String>,
        expected: u64,
        actual: Option<u64>,
    ) -> Self {
        Self::RevisionConflict {
            kind: kind.into(),
            id: id.into(),
            expected,
            actual,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalArgument(_) => ErrorKind::IllegalArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::RevisionConflict { .. } => ErrorKind::RevisionConflict,
            Self::BusinessRuleViolation(_) => ErrorKind::BusinessRuleViolation,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_revision_conflict(&self) -> bool {
        matches!(self, Self::RevisionConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Fatal(format!("lock poisoned: {}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("serialization failure: {}", err))
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Fatal(format!("failed to encode MessagePack: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Fatal(format!("failed to decode MessagePack: {}", err))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Fatal(format!("I/O error: {}", err))
    }
}
