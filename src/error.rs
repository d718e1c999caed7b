//! Shared error taxonomy, split by call site: a narrow error enum at each
//! boundary (Apply Engine, Dispatcher, register loop), converting into the
//! shared [`RsmError`] where a caller needs one unified type.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::ids::SessionId;

/// Client- and server-visible error kinds.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RsmError {
    #[error("no leader is currently known")]
    NoLeader,

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("unknown service {0:?}")]
    UnknownService(String),

    #[error("application error: {0}")]
    ApplicationError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("dispatcher is not open")]
    NotOpen,

    #[error("non-sequential apply: expected index {expected}, got {got}")]
    NonSequential { expected: u64, got: u64 },

    #[error("duplicate apply at index {0}")]
    DuplicateApply(u64),
}

impl RsmError {
    /// Whether the Retry Classifier should retry transparently rather than
    /// surface this to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RsmError::NoLeader | RsmError::Timeout | RsmError::Transport(_))
    }
}

/// Errors an operation may resolve with: reported upward as part of an
/// `OperationResult`, never halting the applier.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationError {
    #[error("unknown service {0:?}")]
    UnknownService(String),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("application error: {0}")]
    ApplicationError(String),
}

impl From<OperationError> for RsmError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::UnknownService(name) => RsmError::UnknownService(name),
            OperationError::UnknownSession(id) => RsmError::UnknownSession(id),
            OperationError::ApplicationError(msg) => RsmError::ApplicationError(msg),
        }
    }
}

/// Errors surfaced from `Dispatcher::submit(Command)` / `submit(Query)`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is not open")]
    NotOpen,
    #[error("session is not open")]
    SessionNotOpen,
    #[error(transparent)]
    Rsm(#[from] RsmError),
}

/// Errors surfaced from the client's `register()` routine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("no leader / no members known")]
    NoLeader,
    #[error("transport error: {0}")]
    Transport(String),
}
