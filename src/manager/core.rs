//! Internal server state machine driver.
//!
//! Consumes the committed log through a single reader, applies each index
//! exactly once in order, and schedules snapshots plus log compaction under
//! load and space pressure. The manager hops between two cooperative
//! contexts: the server context owns the reader, the pending-result map and
//! the compaction future; the state context owns every service and session.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, error, trace, warn};

use crate::config::{Config, StorageOptions};
use crate::core::{
    ApplyOutput, CloseSessionEntry, CommandEntry, Indexed, KeepAliveEntry, LogEntry, MetadataEntry,
    MetadataResult, OpenSessionEntry, QueryEntry, ServiceId, ServiceKind, ServiceName,
    SessionId, SessionMetadata, StateMachineError,
};

use super::context::{ContextHandle, ThreadContext};
use super::future::{Completable, OrderedCompletion};
use super::load::LoadMonitor;
use super::log::{FixedSpace, LogReader, RaftLog, SpaceSource, SpaceStats};
use super::registry::{ServiceRegistry, SessionRegistry};
use super::service::{Service, ServiceContext, ServiceFactories};
use super::session::Session;
use super::snapshot::{
    MemorySnapshotStore, PendingSnapshot, ServiceRecord, SessionRecord, Snapshot, SnapshotError,
    SnapshotStore,
};
use super::{ApplyFuture, ApplyResult};

// Keep enough headroom for a handful of segments before disk pressure kicks
// in.
const SEGMENT_BUFFER_FACTOR: u64 = 5;

pub struct ServiceManagerBuilder {
    config: Config,
    log: Arc<dyn RaftLog>,
    snapshots: Arc<dyn SnapshotStore>,
    space: Arc<dyn SpaceSource>,
    factories: ServiceFactories,
}

impl ServiceManagerBuilder {
    pub fn new(config: Config, log: Arc<dyn RaftLog>) -> Self {
        Self {
            config,
            log,
            snapshots: Arc::new(MemorySnapshotStore::new()),
            space: Arc::new(FixedSpace(SpaceStats::unbounded())),
            factories: ServiceFactories::new(),
        }
    }

    pub fn snapshots(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = store;
        self
    }

    pub fn space(mut self, source: Arc<dyn SpaceSource>) -> Self {
        self.space = source;
        self
    }

    pub fn factories(mut self, factories: ServiceFactories) -> Self {
        self.factories = factories;
        self
    }

    pub fn register_service(
        mut self,
        kind: ServiceKind,
        factory: impl Fn() -> Box<dyn Service> + Send + Sync + 'static,
    ) -> Self {
        self.factories.register(kind, factory);
        self
    }

    pub fn start(self) -> ServiceManager {
        let Self {
            config,
            log,
            snapshots,
            space,
            factories,
        } = self;

        let load = Arc::new(LoadMonitor::new(
            config.load.window(),
            config.load.high_load_threshold,
        ));

        let reader = log.open_reader(1);
        let first_index = reader.first_index();
        let mut initial_applied = first_index.saturating_sub(1);
        if let Some(snapshot) = snapshots.current() {
            initial_applied = initial_applied.max(snapshot.index);
        }
        let last_applied = Arc::new(AtomicU64::new(initial_applied));

        let (server_handle, server_rx) = ContextHandle::channel();
        let (state_handle, state_rx) = ContextHandle::channel();

        let server_core = ManagerCore {
            config: config.clone(),
            log,
            reader,
            space: Arc::clone(&space),
            load: Arc::clone(&load),
            futures: HashMap::new(),
            last_enqueued: first_index.saturating_sub(1),
            last_compacted: first_index.saturating_sub(1),
            compact_future: None,
            last_applied: Arc::clone(&last_applied),
            server: server_handle.clone(),
            state: state_handle.clone(),
        };

        let state_core = StateCore {
            config,
            services: ServiceRegistry::new(),
            sessions: SessionRegistry::new(),
            factories,
            snapshots,
            space,
            load,
            last_applied: Arc::clone(&last_applied),
            server: server_handle.clone(),
            state: state_handle.clone(),
        };

        let server = ThreadContext::start(server_handle.clone(), server_rx, server_core);
        let state = ThreadContext::start(state_handle.clone(), state_rx, state_core);

        server_handle.execute(|core| core.schedule_snapshots());

        ServiceManager {
            server,
            state,
            server_handle,
            state_handle,
            last_applied,
        }
    }
}

/// Drives one or more replicated services from the committed log.
pub struct ServiceManager {
    server: ThreadContext<ManagerCore>,
    state: ThreadContext<StateCore>,
    server_handle: ContextHandle<ManagerCore>,
    state_handle: ContextHandle<StateCore>,
    last_applied: Arc<AtomicU64>,
}

impl ServiceManager {
    pub fn builder(config: Config, log: Arc<dyn RaftLog>) -> ServiceManagerBuilder {
        ServiceManagerBuilder::new(config, log)
    }

    /// Applies all committed entries up to `index`, fire and forget.
    pub fn apply_all(&self, index: u64) {
        self.server_handle
            .execute(move |core| core.enqueue_batch(index));
    }

    /// Applies entries up to `index` and resolves the returned future with
    /// the result of applying `index` itself.
    pub fn apply(&self, index: u64) -> ApplyFuture {
        let future = ApplyFuture::new();
        let user = future.clone();
        let submitted = self
            .server_handle
            .execute(move |core| core.register_apply(index, user));
        if !submitted {
            future.complete(Err(StateMachineError::Shutdown));
        }
        future
    }

    /// Applies an entry directly, bypassing the log reader. Queries enter
    /// here: they are applied against current service state without log
    /// positioning and never advance the applied watermark.
    pub fn apply_entry(&self, entry: Indexed<LogEntry>) -> ApplyFuture {
        let future = ApplyFuture::new();
        let done = future.clone();
        let submitted = self
            .state_handle
            .execute(move |state| state.apply_entry(entry, done));
        if !submitted {
            future.complete(Err(StateMachineError::Shutdown));
        }
        future
    }

    /// Forces a snapshot and log compaction cycle.
    pub fn compact(&self) -> Completable<()> {
        let done = Completable::new();
        let user = done.clone();
        let submitted = self.server_handle.execute(move |core| {
            core.take_snapshots(false, true).when_complete(move |_| {
                user.complete(());
            });
        });
        if !submitted {
            done.complete(());
        }
        done
    }

    /// Highest index whose application has completed on this replica.
    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    /// Stops both contexts after draining already-submitted work.
    pub fn shutdown(self) {
        self.server.shutdown();
        self.state.shutdown();
    }
}

/// State owned by the server context.
struct ManagerCore {
    config: Config,
    log: Arc<dyn RaftLog>,
    reader: Box<dyn LogReader>,
    space: Arc<dyn SpaceSource>,
    load: Arc<LoadMonitor>,
    futures: HashMap<u64, ApplyFuture>,
    last_enqueued: u64,
    last_compacted: u64,
    compact_future: Option<OrderedCompletion<()>>,
    last_applied: Arc<AtomicU64>,
    server: ContextHandle<ManagerCore>,
    state: ContextHandle<StateCore>,
}

impl ManagerCore {
    fn register_apply(&mut self, index: u64, user: ApplyFuture) {
        if self.reader.next_index() > index {
            // Already consumed; the slot (if any) was taken at dispatch time.
            user.complete(Err(StateMachineError::IndexOutOfBounds {
                index,
                next_index: self.reader.next_index(),
            }));
            return;
        }
        let slot = self
            .futures
            .entry(index)
            .or_insert_with(ApplyFuture::new)
            .clone();
        slot.when_complete(move |result| {
            user.complete(result.clone());
        });
        self.enqueue_batch(index);
    }

    fn enqueue_batch(&mut self, index: u64) {
        while self.last_enqueued < index {
            self.last_enqueued += 1;
            let next = self.last_enqueued;
            self.server.execute(move |core| core.apply_index(next));
        }
    }

    fn apply_index(&mut self, index: u64) {
        if self.reader.has_next() && self.reader.next_index() == index {
            let indexed = match self.reader.next() {
                Ok(indexed) => indexed,
                Err(e) => {
                    // Non-deterministic read failure: the reader did not
                    // advance, so later indices stay unapplied rather than
                    // being silently skipped.
                    error!("failed to read index {index}: {e}");
                    if let Some(future) = self.futures.remove(&index) {
                        future.complete(Err(StateMachineError::IndexOutOfBounds {
                            index,
                            next_index: self.reader.next_index(),
                        }));
                    }
                    return;
                }
            };
            let future = self.futures.remove(&index);
            self.dispatch(indexed, future);
        } else if let Some(future) = self.futures.remove(&index) {
            error!("cannot apply index {index}");
            future.complete(Err(StateMachineError::IndexOutOfBounds {
                index,
                next_index: self.reader.next_index(),
            }));
        }
    }

    fn dispatch(&mut self, indexed: Indexed<LogEntry>, future: Option<ApplyFuture>) {
        let index = indexed.index;
        let done = ApplyFuture::new();

        // Every completion from the state context advances the watermark:
        // user-service failures are deterministic and count as applied.
        // Registered first so waiters observe the advanced watermark.
        let last_applied = Arc::clone(&self.last_applied);
        done.when_complete(move |_| {
            last_applied.fetch_max(index, Ordering::SeqCst);
        });
        if let Some(user) = future {
            done.when_complete(move |result| {
                user.complete(result.clone());
            });
        }

        self.state.execute(move |state| state.apply_entry(indexed, done));
    }

    fn schedule_snapshots(&mut self) {
        let interval = self.config.snapshot.interval();
        self.server.schedule(interval, |core| {
            core.take_snapshots(true, false);
        });
    }

    /// Takes a snapshot of all services and compacts the log, unless the
    /// server is under high load and no pressure forces it.
    fn take_snapshots(&mut self, reschedule: bool, force: bool) -> OrderedCompletion<()> {
        // A cycle is already in flight: piggyback on it.
        if let Some(future) = &self.compact_future {
            if reschedule {
                let server = self.server.clone();
                future.when_complete(move |_| {
                    server.execute(|core| core.schedule_snapshots());
                });
            }
            return future.clone();
        }

        let last_applied = self.last_applied.load(Ordering::SeqCst);

        // Only snapshot when compaction below last_applied would release
        // something new.
        if !self.log.is_compactable(last_applied)
            || self.log.compactable_index(last_applied) <= self.last_compacted
        {
            if reschedule {
                self.schedule_snapshots();
            }
            return OrderedCompletion::completed(());
        }

        let out_of_disk = self.running_out_of_disk_space();
        let out_of_memory = self.running_out_of_memory();

        if !force
            && !out_of_memory
            && self.config.storage.dynamic_compaction
            && !out_of_disk
            && self.load.is_under_high_load()
        {
            debug!("skipping compaction due to high load");
            if reschedule {
                self.schedule_snapshots();
            }
            return OrderedCompletion::completed(());
        }

        debug!("snapshotting services");

        let prior_compacted = self.last_compacted;
        self.last_compacted = last_applied;

        // Callbacks queued against the compaction future must fire in
        // registration order so retries against the log keep their order.
        let future = OrderedCompletion::new();
        self.compact_future = Some(future.clone());

        if reschedule {
            let server = self.server.clone();
            future.when_complete(move |_| {
                server.execute(|core| core.schedule_snapshots());
            });
        }

        let rounds = self.config.snapshot.max_completion_rounds;
        self.state.execute(move |state| match state.snapshot() {
            Ok(pending) => state.schedule_completion(pending, rounds, prior_compacted),
            Err(e) => {
                error!("failed to snapshot services: {e}");
                state
                    .server
                    .execute(move |core| core.abort_compaction(prior_compacted));
            }
        });

        future
    }

    /// Gives up on the in-flight cycle. Rolling back `last_compacted` lets
    /// the next scheduled cycle re-attempt the same range.
    fn abort_compaction(&mut self, prior_compacted: u64) {
        self.last_compacted = prior_compacted;
        if let Some(future) = self.compact_future.take() {
            future.complete(());
        }
    }

    fn compact_logs(&mut self, index: u64) {
        debug!("compacting logs up to index {index}");
        if let Err(e) = self.log.compact(index) {
            error!("log compaction failed: {e}");
        }
        if let Some(future) = self.compact_future.take() {
            future.complete(());
        }
        // More of the log may have become compactable while this cycle ran.
        self.take_snapshots(false, false);
    }

    fn running_out_of_disk_space(&self) -> bool {
        out_of_disk(&self.config.storage, &self.space.stats())
    }

    fn running_out_of_memory(&self) -> bool {
        out_of_memory(&self.config.storage, &self.space.stats())
    }
}

/// State owned by the state context.
struct StateCore {
    config: Config,
    services: ServiceRegistry,
    sessions: SessionRegistry,
    factories: ServiceFactories,
    snapshots: Arc<dyn SnapshotStore>,
    space: Arc<dyn SpaceSource>,
    load: Arc<LoadMonitor>,
    last_applied: Arc<AtomicU64>,
    server: ContextHandle<ManagerCore>,
    state: ContextHandle<StateCore>,
}

impl StateCore {
    fn apply_entry(&mut self, indexed: Indexed<LogEntry>, done: ApplyFuture) {
        trace!(
            "applying {} entry at index {}",
            indexed.entry.kind_name(),
            indexed.index
        );
        let Indexed { index, entry } = indexed;

        // Consult the current snapshot: skip entries it covers, install it
        // when the next entry follows it directly.
        if !matches!(&entry, LogEntry::Query(_)) {
            if let Some(snapshot) = self.snapshots.current() {
                if snapshot.index >= index {
                    done.complete(Ok(ApplyOutput::None));
                    return;
                }
                if snapshot.index + 1 == index {
                    self.install(&snapshot);
                }
            }
        }

        let timestamp = entry.timestamp();
        let result = match entry {
            LogEntry::Query(query) => {
                self.apply_query(query, done);
                return;
            }
            LogEntry::Command(command) => self.apply_command(index, command),
            LogEntry::OpenSession(open) => self.apply_open_session(index, open),
            LogEntry::KeepAlive(keep_alive) => self.apply_keep_alive(index, keep_alive),
            LogEntry::CloseSession(close) => self.apply_close_session(index, close),
            LogEntry::Metadata(metadata) => self.apply_metadata(metadata),
            LogEntry::Initialize(_) | LogEntry::Configuration(_) => {
                self.heartbeat_services(index, timestamp);
                Ok(ApplyOutput::None)
            }
        };
        done.complete(result);
        self.drain_ready_queries();
    }

    fn apply_command(&mut self, index: u64, command: CommandEntry) -> ApplyResult {
        let StateCore {
            services,
            sessions,
            load,
            ..
        } = self;
        let Some(session) = sessions.get_mut(command.session_id) else {
            // Possibly removed by a later snapshot on another replica, so
            // this is routine.
            debug!("unknown session {}", command.session_id);
            return Err(StateMachineError::UnknownSession(command.session_id));
        };

        load.record_event();

        let Some(service) = services.get_mut(session.service_id()) else {
            debug!(
                "session {} references deleted service {}",
                command.session_id,
                session.service_id()
            );
            return Err(StateMachineError::UnknownSession(command.session_id));
        };

        let result = service.execute_command(
            index,
            command.sequence,
            command.timestamp,
            session,
            &command.operation,
        );
        Ok(ApplyOutput::Operation(result))
    }

    fn apply_query(&mut self, query: QueryEntry, done: ApplyFuture) {
        let StateCore {
            services, sessions, ..
        } = self;
        let Some(session) = sessions.get(query.session_id) else {
            warn!("unknown session {}", query.session_id);
            done.complete(Err(StateMachineError::UnknownSession(query.session_id)));
            return;
        };
        let Some(service) = services.get_mut(session.service_id()) else {
            done.complete(Err(StateMachineError::UnknownSession(query.session_id)));
            return;
        };
        service.apply_query(query, session, done);
    }

    fn apply_open_session(&mut self, index: u64, open: OpenSessionEntry) -> ApplyResult {
        let service_id = match self.services.lookup_name(&open.service_name) {
            Some(id) => id,
            None => self.initialize_service(
                ServiceId::new(index),
                open.service_kind.clone(),
                open.service_name.clone(),
            )?,
        };

        let timeout_ms = if open.timeout_ms == 0 {
            self.config.session.default_timeout_ms
        } else {
            open.timeout_ms
        };
        let session_id = SessionId::new(index);
        let session = Session::new(
            session_id,
            open.member_id,
            service_id,
            open.service_name,
            open.service_kind,
            open.read_consistency,
            timeout_ms,
            open.timestamp,
        );
        let session = self.sessions.add(session);
        let service = self
            .services
            .get_mut(service_id)
            .expect("service resolved above");
        service.open_session(index, open.timestamp, session);
        Ok(ApplyOutput::SessionId(session_id))
    }

    /// Materializes a service, displacing any prior holder of the name and
    /// purging that holder's sessions.
    fn initialize_service(
        &mut self,
        service_id: ServiceId,
        kind: ServiceKind,
        name: ServiceName,
    ) -> Result<ServiceId, StateMachineError> {
        let Some(instance) = self.factories.create(&kind) else {
            return Err(StateMachineError::UnknownService(kind));
        };
        let context = ServiceContext::new(service_id, name.clone(), kind, instance);
        if let Some(displaced) = self.services.register(context) {
            let purged = self.sessions.remove_service_sessions(displaced);
            if !purged.is_empty() {
                debug!(
                    "re-created service {name}: purged {} prior sessions",
                    purged.len()
                );
            }
        }
        Ok(service_id)
    }

    fn apply_keep_alive(&mut self, index: u64, keep_alive: KeepAliveEntry) -> ApplyResult {
        if !keep_alive.is_well_formed() {
            return Err(StateMachineError::Protocol(
                "keep-alive parallel vectors disagree in length".to_string(),
            ));
        }
        let timestamp = keep_alive.timestamp;
        let mut successful = Vec::with_capacity(keep_alive.session_ids.len());
        let mut touched: BTreeSet<ServiceId> = BTreeSet::new();

        {
            let StateCore {
                services, sessions, ..
            } = self;
            for ((session_id, command_sequence), event_index) in keep_alive
                .session_ids
                .iter()
                .zip(&keep_alive.command_sequences)
                .zip(&keep_alive.event_indexes)
            {
                let Some(session) = sessions.get_mut(*session_id) else {
                    continue;
                };
                let service_id = session.service_id();
                let Some(service) = services.get_mut(service_id) else {
                    continue;
                };
                if service.keep_alive(index, timestamp, session, *command_sequence, *event_index) {
                    successful.push(*session_id);
                    touched.insert(service_id);
                }
            }

            // Completing keep-alives sweeps each touched service's expired
            // sessions.
            for service_id in touched {
                if let Some(service) = services.get_mut(service_id) {
                    for expired in service.complete_keep_alive(index, timestamp, sessions) {
                        debug!("session {expired} expired");
                    }
                }
            }
        }

        self.expire_orphan_sessions(timestamp);
        Ok(ApplyOutput::Sessions(successful))
    }

    /// Sessions whose service was deleted are swept once they time out.
    fn expire_orphan_sessions(&mut self, timestamp: u64) {
        let StateCore {
            services, sessions, ..
        } = self;
        let orphaned: Vec<SessionId> = sessions
            .iter()
            .filter(|session| {
                !services.contains(session.service_id()) && session.is_timed_out(timestamp)
            })
            .map(|session| session.session_id())
            .collect();
        for session_id in orphaned {
            if let Some(session) = sessions.remove(session_id) {
                debug!(
                    "orphaned session {session_id} expired {}ms after last update",
                    timestamp.saturating_sub(session.last_updated())
                );
            }
        }
    }

    fn apply_close_session(&mut self, index: u64, close: CloseSessionEntry) -> ApplyResult {
        let Some(session) = self.sessions.remove(close.session_id) else {
            return Err(StateMachineError::UnknownSession(close.session_id));
        };
        if let Some(service) = self.services.get_mut(session.service_id()) {
            service.close_session(index, close.timestamp, &session, close.expired);
            if close.delete {
                debug!("deleting service {}", session.service_name());
                self.services.unregister(session.service_id());
            }
        }
        Ok(ApplyOutput::None)
    }

    fn apply_metadata(&mut self, metadata: MetadataEntry) -> ApplyResult {
        let scope = match metadata.session_id {
            Some(session_id) => {
                let Some(session) = self.sessions.get(session_id) else {
                    warn!("unknown session {session_id}");
                    return Err(StateMachineError::UnknownSession(session_id));
                };
                Some(session.service_name().clone())
            }
            None => None,
        };

        let mut result = MetadataResult::default();
        for session in self.sessions.iter() {
            if scope
                .as_ref()
                .is_none_or(|name| session.service_name() == name)
            {
                result.sessions.insert(SessionMetadata {
                    session_id: session.session_id(),
                    service_name: session.service_name().clone(),
                    service_kind: session.service_kind().clone(),
                });
            }
        }
        Ok(ApplyOutput::Metadata(result))
    }

    fn heartbeat_services(&mut self, index: u64, timestamp: u64) {
        let StateCore {
            services, sessions, ..
        } = self;
        for service in services.iter_mut() {
            service.keep_alive_sessions(index, timestamp, sessions);
        }
    }

    fn drain_ready_queries(&mut self) {
        let StateCore {
            services, sessions, ..
        } = self;
        for service in services.iter_mut() {
            for pending in service.take_ready_queries() {
                match sessions.get(pending.session_id) {
                    Some(session) => {
                        let result = service.resolve_query(&pending.entry, session);
                        pending.done.complete(Ok(ApplyOutput::Operation(result)));
                    }
                    None => {
                        pending
                            .done
                            .complete(Err(StateMachineError::UnknownSession(pending.session_id)));
                    }
                }
            }
        }
    }

    /// Writes one record per service, in registration order.
    fn snapshot(&mut self) -> Result<PendingSnapshot, SnapshotError> {
        let index = self.last_applied.load(Ordering::SeqCst);
        let mut pending = PendingSnapshot::new(index, now_ms());
        let StateCore {
            services, sessions, ..
        } = self;
        for service in services.iter() {
            let records = sessions
                .service_session_ids(service.service_id())
                .into_iter()
                .filter_map(|id| sessions.get(id))
                .map(SessionRecord::from_session)
                .collect();
            let record = ServiceRecord {
                service_id: service.service_id(),
                kind: service.kind().clone(),
                name: service.name().clone(),
                sessions: records,
                body: service.take_snapshot_body(),
            };
            pending.write_record(&record)?;
        }
        Ok(pending)
    }

    /// Finalizes the snapshot once every session has acknowledged events up
    /// to its index, retrying on a delay with a bounded number of rounds.
    fn schedule_completion(&mut self, pending: PendingSnapshot, rounds_left: u32, prior_compacted: u64) {
        let delay = self.config.snapshot.completion_delay();
        self.state.schedule(delay, move |state| {
            if state.snapshot_complete(pending.index()) {
                debug!("completing snapshot {}", pending.index());
                let snapshot = pending.finish();
                let index = snapshot.index;
                state.snapshots.commit(snapshot);
                if !state.load.is_under_high_load()
                    || state.running_out_of_disk_space()
                    || state.running_out_of_memory()
                {
                    state.request_compaction(index);
                } else {
                    state.schedule_compaction(index);
                }
            } else if rounds_left == 0 {
                warn!(
                    "abandoning snapshot {}: sessions have not completed",
                    pending.index()
                );
                state
                    .server
                    .execute(move |core| core.abort_compaction(prior_compacted));
            } else {
                state.schedule_completion(pending, rounds_left - 1, prior_compacted);
            }
        });
    }

    fn snapshot_complete(&self, index: u64) -> bool {
        self.sessions
            .iter()
            .all(|session| session.last_completed() >= index)
    }

    fn request_compaction(&self, index: u64) {
        self.server.execute(move |core| core.compact_logs(index));
    }

    /// Randomized delay so peers do not all compact at the same instant.
    fn schedule_compaction(&mut self, index: u64) {
        let base = self.config.snapshot.compact_delay();
        let jitter = rand::rng().random_range(Duration::ZERO..=base);
        let delay = base / 2 + jitter;
        trace!("scheduling compaction in {delay:?}");
        self.state
            .schedule(delay, move |state| state.request_compaction(index));
    }

    /// Rebuilds services and their sessions from a finalized snapshot.
    fn install(&mut self, snapshot: &Snapshot) {
        debug!("installing snapshot {}", snapshot.index);
        let mut reader = snapshot.reader();
        loop {
            let record = match reader.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    error!("failed to read snapshot {}: {e}", snapshot.index);
                    break;
                }
            };
            self.install_service(snapshot, record);
        }
    }

    fn install_service(&mut self, snapshot: &Snapshot, record: ServiceRecord) {
        let Some(instance) = self.factories.create(&record.kind) else {
            error!(
                "snapshot {} references unknown service kind {}",
                snapshot.index, record.kind
            );
            return;
        };

        let mut context = ServiceContext::new(
            record.service_id,
            record.name.clone(),
            record.kind.clone(),
            instance,
        );
        if let Err(e) = context.install(snapshot.index, snapshot.timestamp, &record.body) {
            error!("failed to install snapshot for service {}: {e}", record.name);
            return;
        }

        if let Some(displaced) = self.services.register(context) {
            self.sessions.remove_service_sessions(displaced);
        }
        // Replace this service's sessions with the snapshot's view.
        self.sessions.remove_service_sessions(record.service_id);
        for session in record.sessions {
            self.sessions.add(Session::restore(
                session.session_id,
                session.member_id,
                record.service_id,
                record.name.clone(),
                record.kind.clone(),
                session.read_consistency,
                session.timeout_ms,
                session.last_updated,
                session.command_sequence,
                session.event_index,
                snapshot.index,
            ));
        }
    }

    fn running_out_of_disk_space(&self) -> bool {
        out_of_disk(&self.config.storage, &self.space.stats())
    }

    fn running_out_of_memory(&self) -> bool {
        out_of_memory(&self.config.storage, &self.space.stats())
    }
}

fn out_of_disk(storage: &StorageOptions, stats: &SpaceStats) -> bool {
    stats.usable_disk < storage.max_segment_size.saturating_mul(SEGMENT_BUFFER_FACTOR)
        || (stats.total_disk > 0
            && (stats.usable_disk as f64 / stats.total_disk as f64) < storage.free_disk_buffer)
}

fn out_of_memory(storage: &StorageOptions, stats: &SpaceStats) -> bool {
    if !storage.level.is_memory_backed() {
        return false;
    }
    stats.total_memory > 0
        && (stats.free_memory as f64 / stats.total_memory as f64) < storage.free_memory_buffer
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
