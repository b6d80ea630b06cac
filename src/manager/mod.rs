//! Replicated service manager runtime.
//!
//! - context: single-threaded cooperative execution contexts
//! - future: completion primitives
//! - load: advisory load monitor
//! - log: compaction-facing log traits and the in-memory log
//! - registry: session and service registries
//! - session: server-side session state
//! - service: user service seam and execution envelope
//! - snapshot: snapshot objects, store, stream codec
//! - core: the orchestrator

pub mod context;
pub mod future;
pub mod load;
pub mod log;
pub mod registry;
pub mod service;
pub mod session;
pub mod snapshot;

mod core;

use crate::core::{ApplyOutput, StateMachineError};

/// Result of applying one committed entry.
pub type ApplyResult = Result<ApplyOutput, StateMachineError>;

/// Per-index result future handed to apply callers.
pub type ApplyFuture = future::Completable<ApplyResult>;

pub use context::{ContextHandle, TaskReceiver, ThreadContext};
pub use future::{Completable, OrderedCompletion};
pub use load::LoadMonitor;
pub use log::{
    FixedSpace, LogError, LogReader, MemoryLog, RaftLog, SpaceSource, SpaceStats, StorageLevel,
};
pub use self::core::{ServiceManager, ServiceManagerBuilder};
pub use registry::{ServiceRegistry, SessionRegistry};
pub use service::{Commit, QueryContext, Service, ServiceContext, ServiceFactories};
pub use session::{EventBatch, Session};
pub use snapshot::{
    MemorySnapshotStore, PendingSnapshot, ServiceRecord, SessionRecord, Snapshot, SnapshotError,
    SnapshotReader, SnapshotStore, SnapshotWriter,
};
