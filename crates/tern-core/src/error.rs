use std::fmt;

use thiserror::Error;

/// Stable error classification tokens. These cross the RPC boundary and
/// must not change once clients depend on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Busy,
    Aborted,
    Timeout,
    QueuedTimeout,
    ContextLengthExceeded,
    LlmTransient,
    LlmPermanent,
    Persistence,
    CorruptSession,
    NothingToCompact,
    AlreadyCompacted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Busy => "busy",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QueuedTimeout => "queued_timeout",
            ErrorKind::ContextLengthExceeded => "context_length_exceeded",
            ErrorKind::LlmTransient => "llm_transient",
            ErrorKind::LlmPermanent => "llm_permanent",
            ErrorKind::Persistence => "persistence",
            ErrorKind::CorruptSession => "corrupt_session",
            ErrorKind::NothingToCompact => "nothing_to_compact",
            ErrorKind::AlreadyCompacted => "already_compacted",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error type shared by the kernel. Carries a stable kind token plus a
/// human-readable message; structured detail travels in RPC `data`.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn queued_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueuedTimeout, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }

    pub fn corrupt_session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptSession, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::persistence(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::new(ErrorKind::CorruptSession, e.to_string())
    }
}
