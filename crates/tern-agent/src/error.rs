use thiserror::Error;

pub use tern_core::error::ErrorKind;
use tern_core::error::CoreError;

/// Product-crate error: the kernel's kind taxonomy plus persistence and
/// session-level failures raised here.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AgentError {
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

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }

    pub fn corrupt_session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptSession, message)
    }

    pub fn nothing_to_compact() -> Self {
        Self::new(ErrorKind::NothingToCompact, "no cuttable boundary on this branch")
    }

    pub fn already_compacted() -> Self {
        Self::new(ErrorKind::AlreadyCompacted, "branch tip is already a compaction")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<CoreError> for AgentError {
    fn from(e: CoreError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        Self::persistence(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        Self::corrupt_session(e.to_string())
    }
}
