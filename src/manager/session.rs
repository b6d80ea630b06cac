//! Server-side session state.
//!
//! A session is a client's handle against one service. It carries the
//! watermarks that make replicated execution exactly-once: the highest
//! applied command sequence (with cached results for duplicate replay), the
//! highest index at which events were published, and the completion
//! watermark gating snapshot finalization.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::core::{
    MemberId, OperationResult, ReadConsistency, ServiceId, ServiceKind, ServiceName, SessionId,
};

/// Events published at one applied index, pending client acknowledgement.
#[derive(Clone, Debug, PartialEq)]
pub struct EventBatch {
    pub index: u64,
    pub events: Vec<Bytes>,
}

#[derive(Debug)]
pub struct Session {
    session_id: SessionId,
    member_id: MemberId,
    service_id: ServiceId,
    service_name: ServiceName,
    service_kind: ServiceKind,
    read_consistency: ReadConsistency,
    timeout_ms: u64,
    last_updated: u64,
    command_sequence: u64,
    results: BTreeMap<u64, OperationResult>,
    event_index: u64,
    last_applied: u64,
    last_completed: u64,
    pending_events: VecDeque<EventBatch>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        member_id: MemberId,
        service_id: ServiceId,
        service_name: ServiceName,
        service_kind: ServiceKind,
        read_consistency: ReadConsistency,
        timeout_ms: u64,
        created_at: u64,
    ) -> Self {
        let baseline = session_id.get();
        Self {
            session_id,
            member_id,
            service_id,
            service_name,
            service_kind,
            read_consistency,
            timeout_ms,
            last_updated: created_at,
            command_sequence: 0,
            results: BTreeMap::new(),
            event_index: baseline,
            last_applied: baseline,
            last_completed: baseline,
            pending_events: VecDeque::new(),
        }
    }

    /// Rebuilds a session from an installed snapshot. Caches and pending
    /// events start empty: everything at or below the snapshot index was
    /// acknowledged before the snapshot finalized.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        session_id: SessionId,
        member_id: MemberId,
        service_id: ServiceId,
        service_name: ServiceName,
        service_kind: ServiceKind,
        read_consistency: ReadConsistency,
        timeout_ms: u64,
        last_updated: u64,
        command_sequence: u64,
        event_index: u64,
        snapshot_index: u64,
    ) -> Self {
        Self {
            session_id,
            member_id,
            service_id,
            service_name,
            service_kind,
            read_consistency,
            timeout_ms,
            last_updated,
            command_sequence,
            results: BTreeMap::new(),
            event_index,
            last_applied: snapshot_index,
            last_completed: snapshot_index,
            pending_events: VecDeque::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn service_name(&self) -> &ServiceName {
        &self.service_name
    }

    pub fn service_kind(&self) -> &ServiceKind {
        &self.service_kind
    }

    pub fn read_consistency(&self) -> ReadConsistency {
        self.read_consistency
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn last_updated(&self) -> u64 {
        self.last_updated
    }

    /// Highest command sequence applied for this session.
    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    /// Highest index at which events were published to this session.
    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    /// Highest index whose linearizable events have all been acknowledged.
    pub fn last_completed(&self) -> u64 {
        self.last_completed
    }

    pub fn is_timed_out(&self, now: u64) -> bool {
        now.saturating_sub(self.last_updated) > self.timeout_ms
    }

    /// Refreshes liveness. `last_updated` never moves backwards.
    pub fn refresh(&mut self, now: u64) {
        self.last_updated = self.last_updated.max(now);
    }

    /// Caches a command result for duplicate replay and advances the command
    /// sequence watermark.
    pub fn register_result(&mut self, sequence: u64, result: OperationResult) {
        self.results.insert(sequence, result);
        self.command_sequence = self.command_sequence.max(sequence);
    }

    pub fn cached_result(&self, sequence: u64) -> Option<&OperationResult> {
        self.results.get(&sequence)
    }

    /// Drops cached results the client has acknowledged.
    pub fn clear_results(&mut self, up_to_sequence: u64) {
        self.results = self.results.split_off(&(up_to_sequence + 1));
    }

    pub fn cached_result_count(&self) -> usize {
        self.results.len()
    }

    /// Queues events published at `index`. No-op for an empty batch.
    pub fn publish(&mut self, index: u64, events: Vec<Bytes>) {
        if events.is_empty() {
            return;
        }
        self.event_index = self.event_index.max(index);
        self.pending_events.push_back(EventBatch { index, events });
    }

    /// Drops pending event batches the client has acknowledged.
    pub fn ack_events(&mut self, up_to_index: u64) {
        while let Some(front) = self.pending_events.front() {
            if front.index > up_to_index {
                break;
            }
            self.pending_events.pop_front();
        }
        self.recompute_completed();
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.len()
    }

    /// Records that the owning service has applied entries up to `index`.
    pub fn advance_applied(&mut self, index: u64) {
        self.last_applied = self.last_applied.max(index);
        self.recompute_completed();
    }

    fn recompute_completed(&mut self) {
        let completed = match self.pending_events.front() {
            Some(batch) => batch.index.saturating_sub(1),
            None => self.last_applied,
        };
        self.last_completed = self.last_completed.max(completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServiceFailure;

    fn session() -> Session {
        Session::new(
            SessionId::new(5),
            MemberId::new("node-1").unwrap(),
            ServiceId::new(5),
            ServiceName::new("locks").unwrap(),
            ServiceKind::new("kv").unwrap(),
            ReadConsistency::Linearizable,
            1_000,
            100,
        )
    }

    #[test]
    fn watermarks_start_at_the_creating_index() {
        let s = session();
        assert_eq!(s.event_index(), 5);
        assert_eq!(s.last_completed(), 5);
        assert_eq!(s.command_sequence(), 0);
    }

    #[test]
    fn timeout_is_relative_to_last_updated() {
        let mut s = session();
        assert!(!s.is_timed_out(1_100));
        assert!(s.is_timed_out(1_101));
        s.refresh(2_000);
        assert!(!s.is_timed_out(3_000));
        // refresh never goes backwards
        s.refresh(1_500);
        assert_eq!(s.last_updated(), 2_000);
    }

    #[test]
    fn cached_results_replay_and_clear() {
        let mut s = session();
        s.register_result(1, OperationResult::succeeded(6, 5, Bytes::from_static(b"a")));
        s.register_result(
            2,
            OperationResult::failed(7, 5, ServiceFailure::new("nope")),
        );
        assert_eq!(s.command_sequence(), 2);
        assert!(s.cached_result(1).is_some());

        s.clear_results(1);
        assert!(s.cached_result(1).is_none());
        assert!(s.cached_result(2).is_some());
        assert_eq!(s.command_sequence(), 2);
    }

    #[test]
    fn completion_tracks_pending_events() {
        let mut s = session();
        s.advance_applied(6);
        assert_eq!(s.last_completed(), 6);

        s.publish(7, vec![Bytes::from_static(b"evt")]);
        s.advance_applied(7);
        assert_eq!(s.event_index(), 7);
        assert_eq!(s.last_completed(), 6);

        s.ack_events(7);
        assert_eq!(s.last_completed(), 7);
        assert_eq!(s.pending_event_count(), 0);
    }

    #[test]
    fn completion_never_decreases() {
        let mut s = session();
        s.advance_applied(9);
        assert_eq!(s.last_completed(), 9);
        s.publish(10, vec![Bytes::from_static(b"evt")]);
        assert_eq!(s.last_completed(), 9);
        s.ack_events(3);
        assert_eq!(s.last_completed(), 9);
    }
}
