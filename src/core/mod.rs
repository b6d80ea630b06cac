//! Core domain types.
//!
//! Module hierarchy follows type dependency order:
//! - error: identifier and state-machine error taxonomy
//! - identity: SessionId, ServiceId, MemberId, ServiceName, ServiceKind
//! - operation: ServiceOperation, OperationResult, ApplyOutput
//! - entry: Indexed, LogEntry and per-kind payloads

pub mod entry;
pub mod error;
pub mod identity;
pub mod operation;

pub use entry::{
    CloseSessionEntry, CommandEntry, ConfigurationEntry, Indexed, InitializeEntry, KeepAliveEntry,
    LogEntry, MetadataEntry, OpenSessionEntry, QueryEntry, operation,
};
pub use error::{InvalidId, ServiceFailure, StateMachineError};
pub use identity::{MemberId, ReadConsistency, ServiceId, ServiceKind, ServiceName, SessionId};
pub use operation::{
    ApplyOutput, MetadataResult, OperationResult, ServiceOperation, SessionMetadata,
};
