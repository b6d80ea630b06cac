//! State machine error taxonomy.
//!
//! These are bounded and stable: they represent domain/refusal states the
//! consensus layer and clients can act on, not library implementation
//! details. Errors surfaced through per-index apply futures must be `Clone`
//! because a single index may have several waiters.

use thiserror::Error;

use super::identity::{ServiceKind, SessionId};

/// Identifier validation failure.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum InvalidId {
    #[error("invalid member id: {reason}")]
    Member { reason: &'static str },
    #[error("invalid service name: {reason}")]
    Service { reason: &'static str },
    #[error("invalid service kind: {reason}")]
    Kind { reason: &'static str },
}

/// Deterministic failure raised by a user service operation.
///
/// Failures are part of the replicated state transition: the same entry
/// produces the same failure on every replica, so they are cached and
/// replayed like successful results.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ServiceFailure(pub String);

impl ServiceFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors produced while applying committed entries.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateMachineError {
    /// The referenced session does not exist (expired, closed, or covered by
    /// a later snapshot). The entry is still consumed.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// OpenSession referenced a service kind with no registered factory.
    #[error("unknown service kind {0}")]
    UnknownService(ServiceKind),

    /// The entry payload violates the wire contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An apply was requested for an index the reader cannot reach.
    #[error("cannot apply index {index}: reader is at {next_index}")]
    IndexOutOfBounds { index: u64, next_index: u64 },

    /// A user service operation failed deterministically.
    #[error(transparent)]
    Application(#[from] ServiceFailure),

    /// The manager was shut down before the entry was applied.
    #[error("service manager is shut down")]
    Shutdown,
}
