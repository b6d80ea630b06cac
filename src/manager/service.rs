//! User service seam and per-service execution envelope.
//!
//! [`Service`] is what embedders implement: a deterministic state machine
//! driven by committed operations. [`ServiceContext`] wraps one instance
//! with the bookkeeping replicated execution needs - sequence dedup, result
//! caching, event publication, version-gated queries, and session sweeps.
//! All of it runs on the state context.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::core::{
    ApplyOutput, OperationResult, QueryEntry, ServiceFailure, ServiceId, ServiceKind, ServiceName,
    ServiceOperation, SessionId,
};

use super::ApplyFuture;
use super::registry::SessionRegistry;
use super::session::Session;

/// Execution context for a command. Events published here are queued on the
/// committing session and delivered by the transport layer.
pub struct Commit<'a> {
    pub index: u64,
    pub timestamp: u64,
    pub session: &'a Session,
    pub operation: &'a ServiceOperation,
    events: &'a mut Vec<Bytes>,
}

impl Commit<'_> {
    /// Publishes a session event tied to this commit's index.
    pub fn publish(&mut self, event: impl Into<Bytes>) {
        self.events.push(event.into());
    }
}

/// Execution context for a query. Queries run on a single replica and can
/// never publish events.
pub struct QueryContext<'a> {
    pub index: u64,
    pub timestamp: u64,
    pub session: &'a Session,
    pub operation: &'a ServiceOperation,
}

/// A user-provided deterministic state machine.
///
/// Implementations must be deterministic functions of the committed
/// operation stream: identical entries produce identical results and
/// identical snapshots on every replica.
pub trait Service: Send {
    /// Applies a mutating operation.
    fn execute(&mut self, commit: &mut Commit<'_>) -> Result<Bytes, ServiceFailure>;

    /// Applies a read-only operation.
    fn query(&self, context: &QueryContext<'_>) -> Result<Bytes, ServiceFailure>;

    /// Serializes the service state. The bytes are opaque to the core.
    fn take_snapshot(&self) -> Bytes;

    /// Replaces the service state from a snapshot body.
    fn install_snapshot(&mut self, data: &[u8]) -> Result<(), ServiceFailure>;

    fn session_opened(&mut self, _session: &Session) {}

    fn session_closed(&mut self, _session: &Session) {}

    fn session_expired(&mut self, _session: &Session) {}
}

type Factory = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// Service constructors by kind, consulted when an OpenSession or snapshot
/// install materializes a service.
#[derive(Clone, Default)]
pub struct ServiceFactories {
    factories: HashMap<ServiceKind, Factory>,
}

impl ServiceFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: ServiceKind,
        factory: impl Fn() -> Box<dyn Service> + Send + Sync + 'static,
    ) {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn contains(&self, kind: &ServiceKind) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn create(&self, kind: &ServiceKind) -> Option<Box<dyn Service>> {
        self.factories.get(kind).map(|factory| factory())
    }
}

pub(crate) struct PendingQuery {
    pub entry: QueryEntry,
    pub session_id: SessionId,
    pub done: ApplyFuture,
}

/// Per-service execution envelope.
pub struct ServiceContext {
    service_id: ServiceId,
    name: ServiceName,
    kind: ServiceKind,
    service: Box<dyn Service>,
    current_index: u64,
    current_timestamp: u64,
    // queries waiting for the service to reach their index, keyed by it
    pending_queries: BTreeMap<u64, Vec<PendingQuery>>,
}

impl ServiceContext {
    pub fn new(
        service_id: ServiceId,
        name: ServiceName,
        kind: ServiceKind,
        service: Box<dyn Service>,
    ) -> Self {
        Self {
            service_id,
            name,
            kind,
            service,
            current_index: 0,
            current_timestamp: 0,
            pending_queries: BTreeMap::new(),
        }
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub fn current_index(&self) -> u64 {
        self.current_index
    }

    pub fn current_timestamp(&self) -> u64 {
        self.current_timestamp
    }

    fn tick(&mut self, index: u64, timestamp: u64) {
        self.current_index = self.current_index.max(index);
        self.current_timestamp = self.current_timestamp.max(timestamp);
    }

    pub fn open_session(&mut self, index: u64, timestamp: u64, session: &Session) {
        self.tick(index, timestamp);
        self.service.session_opened(session);
    }

    /// Applies a command, deduplicating by client sequence.
    ///
    /// A sequence at or below the session's watermark is a duplicate of a
    /// command that already applied; it replays the cached result and
    /// touches no service state.
    pub fn execute_command(
        &mut self,
        index: u64,
        sequence: u64,
        timestamp: u64,
        session: &mut Session,
        operation: &ServiceOperation,
    ) -> OperationResult {
        self.tick(index, timestamp);

        if sequence > 0 && sequence <= session.command_sequence() {
            if let Some(cached) = session.cached_result(sequence) {
                trace!(
                    session = %session.session_id(),
                    sequence,
                    "replaying cached command result"
                );
                return cached.clone();
            }
            // The client acknowledged past this sequence, so it will never
            // await this response.
            debug!(
                session = %session.session_id(),
                sequence,
                "duplicate command with evicted result"
            );
            return OperationResult::succeeded(index, session.event_index(), Bytes::new());
        }

        let mut events = Vec::new();
        let result = {
            let mut commit = Commit {
                index,
                timestamp,
                session: &*session,
                operation,
                events: &mut events,
            };
            self.service.execute(&mut commit)
        };
        session.publish(index, events);
        session.advance_applied(index);

        let result = OperationResult {
            index,
            event_index: session.event_index(),
            result,
        };
        session.register_result(sequence, result.clone());
        result
    }

    /// Applies or parks a query depending on the session's observed index.
    pub fn apply_query(&mut self, entry: QueryEntry, session: &Session, done: ApplyFuture) {
        if self.current_index >= entry.last_index {
            let result = self.resolve_query(&entry, session);
            done.complete(Ok(ApplyOutput::Operation(result)));
        } else {
            trace!(
                session = %session.session_id(),
                wanted = entry.last_index,
                at = self.current_index,
                "parking query until the service catches up"
            );
            let session_id = session.session_id();
            self.pending_queries
                .entry(entry.last_index)
                .or_default()
                .push(PendingQuery {
                    entry,
                    session_id,
                    done,
                });
        }
    }

    pub(crate) fn resolve_query(&self, entry: &QueryEntry, session: &Session) -> OperationResult {
        let context = QueryContext {
            index: self.current_index,
            timestamp: self.current_timestamp,
            session,
            operation: &entry.operation,
        };
        OperationResult {
            index: self.current_index,
            event_index: session.event_index(),
            result: self.service.query(&context),
        }
    }

    /// Takes the queries whose required index has been reached.
    pub(crate) fn take_ready_queries(&mut self) -> Vec<PendingQuery> {
        let rest = self.pending_queries.split_off(&(self.current_index + 1));
        let ready = std::mem::replace(&mut self.pending_queries, rest);
        ready.into_values().flatten().collect()
    }

    /// Refreshes one session from a keep-alive triple and garbage-collects
    /// what the client has acknowledged. Returns false when the session had
    /// already timed out; the sweep in [`Self::complete_keep_alive`] removes
    /// it.
    pub fn keep_alive(
        &mut self,
        index: u64,
        timestamp: u64,
        session: &mut Session,
        command_sequence: u64,
        event_index: u64,
    ) -> bool {
        self.tick(index, timestamp);
        if session.is_timed_out(timestamp) {
            return false;
        }
        session.clear_results(command_sequence);
        session.ack_events(event_index);
        session.refresh(timestamp);
        session.advance_applied(index);
        true
    }

    /// Sweeps this service's timed-out sessions after a keep-alive entry.
    pub fn complete_keep_alive(
        &mut self,
        index: u64,
        timestamp: u64,
        sessions: &mut SessionRegistry,
    ) -> Vec<SessionId> {
        self.tick(index, timestamp);
        let mut expired = Vec::new();
        for session_id in sessions.service_session_ids(self.service_id) {
            let timed_out = sessions
                .get(session_id)
                .is_some_and(|session| session.is_timed_out(timestamp));
            if !timed_out {
                continue;
            }
            if let Some(session) = sessions.remove(session_id) {
                self.service.session_expired(&session);
                expired.push(session_id);
            }
        }
        expired
    }

    /// Heartbeat from Initialize/Configuration entries: advances service
    /// time and session watermarks without any other side effect.
    pub fn keep_alive_sessions(
        &mut self,
        index: u64,
        timestamp: u64,
        sessions: &mut SessionRegistry,
    ) {
        self.tick(index, timestamp);
        for session_id in sessions.service_session_ids(self.service_id) {
            if let Some(session) = sessions.get_mut(session_id) {
                session.advance_applied(index);
            }
        }
    }

    pub fn close_session(&mut self, index: u64, timestamp: u64, session: &Session, expired: bool) {
        self.tick(index, timestamp);
        if expired {
            self.service.session_expired(session);
        } else {
            self.service.session_closed(session);
        }
    }

    pub fn take_snapshot_body(&self) -> Bytes {
        self.service.take_snapshot()
    }

    /// Replaces service state from an installed snapshot body.
    pub fn install(
        &mut self,
        index: u64,
        timestamp: u64,
        body: &[u8],
    ) -> Result<(), ServiceFailure> {
        self.tick(index, timestamp);
        self.service.install_snapshot(body)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::{MemberId, ReadConsistency, operation};

    /// Service that accepts everything and does nothing.
    pub(crate) struct NullService;

    impl Service for NullService {
        fn execute(&mut self, _commit: &mut Commit<'_>) -> Result<Bytes, ServiceFailure> {
            Ok(Bytes::new())
        }

        fn query(&self, _context: &QueryContext<'_>) -> Result<Bytes, ServiceFailure> {
            Ok(Bytes::new())
        }

        fn take_snapshot(&self) -> Bytes {
            Bytes::new()
        }

        fn install_snapshot(&mut self, _data: &[u8]) -> Result<(), ServiceFailure> {
            Ok(())
        }
    }

    /// Counter service used to observe side effects.
    struct Counter {
        value: u64,
    }

    impl Service for Counter {
        fn execute(&mut self, commit: &mut Commit<'_>) -> Result<Bytes, ServiceFailure> {
            match commit.operation.name.as_str() {
                "incr" => {
                    self.value += 1;
                    Ok(Bytes::copy_from_slice(&self.value.to_be_bytes()))
                }
                other => Err(ServiceFailure::new(format!("unknown operation {other}"))),
            }
        }

        fn query(&self, _context: &QueryContext<'_>) -> Result<Bytes, ServiceFailure> {
            Ok(Bytes::copy_from_slice(&self.value.to_be_bytes()))
        }

        fn take_snapshot(&self) -> Bytes {
            Bytes::copy_from_slice(&self.value.to_be_bytes())
        }

        fn install_snapshot(&mut self, data: &[u8]) -> Result<(), ServiceFailure> {
            let bytes: [u8; 8] = data
                .try_into()
                .map_err(|_| ServiceFailure::new("bad counter snapshot"))?;
            self.value = u64::from_be_bytes(bytes);
            Ok(())
        }
    }

    fn counter_context() -> ServiceContext {
        ServiceContext::new(
            ServiceId::new(1),
            ServiceName::new("counter").unwrap(),
            ServiceKind::new("counter").unwrap(),
            Box::new(Counter { value: 0 }),
        )
    }

    fn session(id: u64) -> Session {
        Session::new(
            SessionId::new(id),
            MemberId::new("node-1").unwrap(),
            ServiceId::new(1),
            ServiceName::new("counter").unwrap(),
            ServiceKind::new("counter").unwrap(),
            ReadConsistency::Linearizable,
            1_000,
            0,
        )
    }

    #[test]
    fn duplicate_sequence_replays_without_side_effect() {
        let mut service = counter_context();
        let mut session = session(1);
        let op = operation("incr", Bytes::new());

        let first = service.execute_command(2, 1, 10, &mut session, &op);
        assert_eq!(first.result.as_ref().unwrap().as_ref(), 1u64.to_be_bytes());

        let replay = service.execute_command(3, 1, 11, &mut session, &op);
        assert_eq!(replay, first);

        let second = service.execute_command(4, 2, 12, &mut session, &op);
        assert_eq!(second.result.as_ref().unwrap().as_ref(), 2u64.to_be_bytes());
    }

    #[test]
    fn deterministic_failure_is_cached_too() {
        let mut service = counter_context();
        let mut session = session(1);
        let op = operation("boom", Bytes::new());

        let first = service.execute_command(2, 1, 10, &mut session, &op);
        assert!(first.result.is_err());
        let replay = service.execute_command(3, 1, 11, &mut session, &op);
        assert_eq!(replay, first);
    }

    #[test]
    fn query_parks_until_index_reached() {
        let mut service = counter_context();
        let mut session = session(1);

        let entry = QueryEntry {
            timestamp: 10,
            session_id: session.session_id(),
            sequence: 1,
            last_index: 3,
            operation: operation("get", Bytes::new()),
        };
        let done = ApplyFuture::new();
        service.apply_query(entry, &session, done.clone());
        assert!(!done.is_complete());

        service.execute_command(3, 1, 11, &mut session, &operation("incr", Bytes::new()));
        let ready = service.take_ready_queries();
        assert_eq!(ready.len(), 1);
        let result = service.resolve_query(&ready[0].entry, &session);
        assert_eq!(result.result.unwrap().as_ref(), 1u64.to_be_bytes());
    }

    #[test]
    fn keep_alive_rejects_timed_out_session() {
        let mut service = counter_context();
        let mut s = session(1);
        // timeout is 1000ms from last_updated=0
        assert!(!service.keep_alive(5, 5_000, &mut s, 0, 0));
        assert!(service.keep_alive(5, 500, &mut s, 0, 0));
    }
}
