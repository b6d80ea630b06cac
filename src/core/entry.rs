//! Committed log entry schema.
//!
//! One enum arm per entry kind; dispatch is a single match. The log index is
//! carried by [`Indexed`] and is authoritative - no inner field repeats it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::identity::{MemberId, ReadConsistency, ServiceKind, ServiceName, SessionId};
use super::operation::ServiceOperation;

/// A value paired with its log index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Indexed<T> {
    pub index: u64,
    pub entry: T,
}

impl<T> Indexed<T> {
    pub fn new(index: u64, entry: T) -> Self {
        Self { index, entry }
    }
}

/// A committed entry as handed to the state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    Command(CommandEntry),
    Query(QueryEntry),
    OpenSession(OpenSessionEntry),
    KeepAlive(KeepAliveEntry),
    CloseSession(CloseSessionEntry),
    Metadata(MetadataEntry),
    Initialize(InitializeEntry),
    Configuration(ConfigurationEntry),
}

impl LogEntry {
    /// Wall-clock milliseconds stamped by the leader when the entry was
    /// appended.
    pub fn timestamp(&self) -> u64 {
        match self {
            LogEntry::Command(e) => e.timestamp,
            LogEntry::Query(e) => e.timestamp,
            LogEntry::OpenSession(e) => e.timestamp,
            LogEntry::KeepAlive(e) => e.timestamp,
            LogEntry::CloseSession(e) => e.timestamp,
            LogEntry::Metadata(e) => e.timestamp,
            LogEntry::Initialize(e) => e.timestamp,
            LogEntry::Configuration(e) => e.timestamp,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            LogEntry::Command(_) => "command",
            LogEntry::Query(_) => "query",
            LogEntry::OpenSession(_) => "open-session",
            LogEntry::KeepAlive(_) => "keep-alive",
            LogEntry::CloseSession(_) => "close-session",
            LogEntry::Metadata(_) => "metadata",
            LogEntry::Initialize(_) => "initialize",
            LogEntry::Configuration(_) => "configuration",
        }
    }
}

/// A mutating operation replicated through the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub timestamp: u64,
    pub session_id: SessionId,
    /// Client-assigned sequence number; duplicates are deduplicated against
    /// the session's highest applied sequence.
    pub sequence: u64,
    pub operation: ServiceOperation,
}

/// A read-only operation applied on a single replica.
///
/// Queries never pass through the log reader; they enter via
/// `apply_entry` with a synthesized index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
    pub timestamp: u64,
    pub session_id: SessionId,
    pub sequence: u64,
    /// Highest index the client has observed. The query is held until the
    /// session's service has advanced at least this far, preserving
    /// monotonic reads across server switches.
    pub last_index: u64,
    pub operation: ServiceOperation,
}

/// Registers a new session against a named service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenSessionEntry {
    pub timestamp: u64,
    pub member_id: MemberId,
    pub service_name: ServiceName,
    pub service_kind: ServiceKind,
    pub read_consistency: ReadConsistency,
    /// Session timeout in milliseconds; 0 selects the configured default.
    pub timeout_ms: u64,
}

/// Refreshes session liveness and conveys client acknowledgement watermarks.
///
/// The three vectors are parallel: `session_ids[i]` acknowledges commands up
/// to `command_sequences[i]` and events up to `event_indexes[i]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveEntry {
    pub timestamp: u64,
    pub session_ids: Vec<SessionId>,
    pub command_sequences: Vec<u64>,
    pub event_indexes: Vec<u64>,
}

impl KeepAliveEntry {
    /// The parallel vectors must agree on length before any session is
    /// touched.
    pub fn is_well_formed(&self) -> bool {
        self.session_ids.len() == self.command_sequences.len()
            && self.session_ids.len() == self.event_indexes.len()
    }
}

/// Closes a session, optionally deleting the owning service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseSessionEntry {
    pub timestamp: u64,
    pub session_id: SessionId,
    /// True when the leader expired the session rather than the client
    /// closing it.
    pub expired: bool,
    /// True to tear down the service along with the session.
    pub delete: bool,
}

/// Reads session metadata, scoped to one service or the whole registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub timestamp: u64,
    /// When set, restrict the listing to sessions sharing this session's
    /// service.
    pub session_id: Option<SessionId>,
}

/// Written at the start of a leader's term to commit prior-term entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitializeEntry {
    pub timestamp: u64,
}

/// A cluster membership change. The payload is applied by the consensus
/// layer; services only observe the heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub timestamp: u64,
    pub members: Vec<MemberId>,
}

/// Convenience for building opaque operation payloads in tests and
/// embedders.
pub fn operation(name: impl Into<String>, input: impl Into<Bytes>) -> ServiceOperation {
    ServiceOperation {
        name: name.into(),
        input: input.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_well_formedness() {
        let ok = KeepAliveEntry {
            timestamp: 1,
            session_ids: vec![SessionId::new(1), SessionId::new(2)],
            command_sequences: vec![3, 4],
            event_indexes: vec![0, 0],
        };
        assert!(ok.is_well_formed());

        let bad = KeepAliveEntry {
            timestamp: 1,
            session_ids: vec![SessionId::new(1)],
            command_sequences: vec![],
            event_indexes: vec![0],
        };
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn timestamp_is_uniform_across_kinds() {
        let entry = LogEntry::Initialize(InitializeEntry { timestamp: 42 });
        assert_eq!(entry.timestamp(), 42);
        assert_eq!(entry.kind_name(), "initialize");
    }
}
