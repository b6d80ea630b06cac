#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod manager;

pub use config::Config;
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    ApplyOutput, CloseSessionEntry, CommandEntry, ConfigurationEntry, Indexed, InitializeEntry,
    InvalidId, KeepAliveEntry, LogEntry, MemberId, MetadataEntry, MetadataResult, OpenSessionEntry,
    OperationResult, QueryEntry, ReadConsistency, ServiceFailure, ServiceId, ServiceKind,
    ServiceName, ServiceOperation, SessionId, SessionMetadata, StateMachineError, operation,
};
pub use crate::manager::{
    ApplyFuture, ApplyResult, Commit, Completable, FixedSpace, LoadMonitor, LogReader, MemoryLog,
    MemorySnapshotStore, OrderedCompletion, QueryContext, RaftLog, Service, ServiceFactories,
    ServiceManager, ServiceManagerBuilder, Session, Snapshot, SnapshotStore, SpaceSource,
    SpaceStats, StorageLevel,
};
