//! Operation and result value types.

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::ServiceFailure;
use super::identity::{ServiceKind, ServiceName, SessionId};

/// An operation submitted to a user service. The input is opaque to the
/// core; only the service interprets it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceOperation {
    pub name: String,
    pub input: Bytes,
}

/// The outcome of a command or query against a user service.
///
/// `index` is the log index at which the operation was applied and `event_index`
/// the session's event watermark at completion; clients use the pair to gate
/// monotonic reads. Deterministic failures are carried as values so they can
/// be cached and replayed for duplicate commands.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationResult {
    pub index: u64,
    pub event_index: u64,
    pub result: Result<Bytes, ServiceFailure>,
}

impl OperationResult {
    pub fn succeeded(index: u64, event_index: u64, output: Bytes) -> Self {
        Self {
            index,
            event_index,
            result: Ok(output),
        }
    }

    pub fn failed(index: u64, event_index: u64, failure: ServiceFailure) -> Self {
        Self {
            index,
            event_index,
            result: Err(failure),
        }
    }
}

/// One row of a metadata listing.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub service_name: ServiceName,
    pub service_kind: ServiceKind,
}

/// Result of a Metadata entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataResult {
    pub sessions: BTreeSet<SessionMetadata>,
}

/// What applying a committed entry produced, keyed by entry kind.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutput {
    /// Entry consumed with no caller-visible result (skips, close-session,
    /// initialize, configuration).
    None,
    /// OpenSession: the assigned session id.
    SessionId(SessionId),
    /// KeepAlive: the session ids that were successfully refreshed.
    Sessions(Vec<SessionId>),
    /// Command or query result.
    Operation(OperationResult),
    /// Metadata listing.
    Metadata(MetadataResult),
}

impl ApplyOutput {
    /// Unwraps an operation result, for callers that know the entry kind.
    pub fn into_operation(self) -> Option<OperationResult> {
        match self {
            ApplyOutput::Operation(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_session_id(self) -> Option<SessionId> {
        match self {
            ApplyOutput::SessionId(id) => Some(id),
            _ => None,
        }
    }
}
