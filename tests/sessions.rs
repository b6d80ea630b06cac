//! Session lifecycle: keep-alive sweeps, orphan expiry, metadata scoping.

mod fixtures;

use fixtures::kv::{command_entry, commit, fast_config, open_session_entry, start_manager};
use tiller_rs::manager::MemorySnapshotStore;
use tiller_rs::{
    ApplyOutput, CloseSessionEntry, KeepAliveEntry, LogEntry, MemoryLog, MetadataEntry,
    MetadataResult, SessionId, StateMachineError,
};

fn keep_alive(timestamp: u64, triples: &[(u64, u64, u64)]) -> LogEntry {
    LogEntry::KeepAlive(KeepAliveEntry {
        timestamp,
        session_ids: triples.iter().map(|t| SessionId::new(t.0)).collect(),
        command_sequences: triples.iter().map(|t| t.1).collect(),
        event_indexes: triples.iter().map(|t| t.2).collect(),
    })
}

fn metadata(
    log: &MemoryLog,
    manager: &tiller_rs::ServiceManager,
    timestamp: u64,
    session_id: Option<u64>,
) -> Result<MetadataResult, StateMachineError> {
    let (_, result) = commit(
        log,
        manager,
        LogEntry::Metadata(MetadataEntry {
            timestamp,
            session_id: session_id.map(SessionId::new),
        }),
    );
    result.map(|output| {
        let ApplyOutput::Metadata(listing) = output else {
            panic!("expected metadata output");
        };
        listing
    })
}

fn session_ids(listing: &MetadataResult) -> Vec<u64> {
    listing.sessions.iter().map(|m| m.session_id.get()).collect()
}

#[test]
fn keep_alive_reports_refreshed_sessions() {
    let log = MemoryLog::new();
    let snapshots = MemorySnapshotStore::shared();
    let manager = start_manager(fast_config(), &log, &snapshots);

    commit(&log, &manager, open_session_entry("a", 10, 1_000));
    commit(&log, &manager, open_session_entry("a", 10, 1_000));

    let (_, result) = commit(&log, &manager, keep_alive(500, &[(1, 0, 0), (2, 0, 0), (9, 0, 0)]));
    // The unknown session id 9 is skipped, not an error.
    assert_eq!(
        result.unwrap(),
        ApplyOutput::Sessions(vec![SessionId::new(1), SessionId::new(2)])
    );

    manager.shutdown();
}

#[test]
fn keep_alive_sweeps_expired_sessions_of_the_touched_service() {
    let log = MemoryLog::new();
    let snapshots = MemorySnapshotStore::shared();
    let manager = start_manager(fast_config(), &log, &snapshots);

    commit(&log, &manager, open_session_entry("a", 10, 1_000));
    commit(&log, &manager, open_session_entry("a", 10, 1_000));

    // Only session 1 keeps alive; by timestamp 5_000 session 2 has expired
    // and the completing sweep removes it.
    let (_, result) = commit(&log, &manager, keep_alive(900, &[(1, 0, 0)]));
    result.unwrap();
    let (_, result) = commit(&log, &manager, keep_alive(1_500, &[(1, 0, 0)]));
    result.unwrap();
    let (_, result) = commit(&log, &manager, keep_alive(5_000, &[(1, 0, 0)]));
    assert_eq!(result.unwrap(), ApplyOutput::Sessions(vec![]));

    // Session 1 itself timed out at 5_000 (last refresh 1_500): nothing
    // swept it yet because its keep-alive failed, but session 2 is gone.
    let listing = metadata(&log, &manager, 5_001, None).unwrap();
    assert!(!session_ids(&listing).contains(&2));

    manager.shutdown();
}

#[test]
fn orphaned_sessions_expire_after_their_service_is_deleted() {
    let log = MemoryLog::new();
    let snapshots = MemorySnapshotStore::shared();
    let manager = start_manager(fast_config(), &log, &snapshots);

    commit(&log, &manager, open_session_entry("a", 10, 1_000)); // session 1
    commit(&log, &manager, open_session_entry("a", 10, 1_000)); // session 2

    // Deleting the service through session 1 leaves session 2 orphaned.
    let (_, closed) = commit(
        &log,
        &manager,
        LogEntry::CloseSession(CloseSessionEntry {
            timestamp: 20,
            session_id: SessionId::new(1),
            expired: false,
            delete: true,
        }),
    );
    closed.unwrap();

    // Within the timeout the orphan survives the sweep.
    commit(&log, &manager, keep_alive(500, &[])).1.unwrap();
    let listing = metadata(&log, &manager, 501, None).unwrap();
    assert_eq!(session_ids(&listing), vec![2]);

    // Once timed out it is removed by the next keep-alive sweep.
    commit(&log, &manager, keep_alive(5_000, &[])).1.unwrap();
    let listing = metadata(&log, &manager, 5_001, None).unwrap();
    assert!(session_ids(&listing).is_empty());

    manager.shutdown();
}

#[test]
fn metadata_scopes_to_the_named_sessions_service() {
    let log = MemoryLog::new();
    let snapshots = MemorySnapshotStore::shared();
    let manager = start_manager(fast_config(), &log, &snapshots);

    commit(&log, &manager, open_session_entry("a", 10, 5_000)); // 1
    commit(&log, &manager, open_session_entry("b", 10, 5_000)); // 2
    commit(&log, &manager, open_session_entry("a", 10, 5_000)); // 3

    let scoped = metadata(&log, &manager, 11, Some(1)).unwrap();
    assert_eq!(session_ids(&scoped), vec![1, 3]);

    let all = metadata(&log, &manager, 12, None).unwrap();
    assert_eq!(session_ids(&all), vec![1, 2, 3]);

    let unknown = metadata(&log, &manager, 13, Some(99));
    assert_eq!(
        unknown.unwrap_err(),
        StateMachineError::UnknownSession(SessionId::new(99))
    );

    manager.shutdown();
}

#[test]
fn open_session_with_zero_timeout_uses_the_configured_default() {
    let log = MemoryLog::new();
    let snapshots = MemorySnapshotStore::shared();
    let mut config = fast_config();
    config.session.default_timeout_ms = 100;
    let manager = start_manager(config, &log, &snapshots);

    commit(&log, &manager, open_session_entry("a", 10, 0)); // session 1
    commit(&log, &manager, open_session_entry("a", 10, 60_000)); // session 2

    // Session 2's keep-alive sweeps session 1, expired under the 100ms
    // default.
    commit(&log, &manager, keep_alive(300, &[(2, 0, 0)])).1.unwrap();
    let listing = metadata(&log, &manager, 301, None).unwrap();
    assert_eq!(session_ids(&listing), vec![2]);

    manager.shutdown();
}

#[test]
fn closing_an_unknown_session_is_an_error_but_consumes_the_entry() {
    let log = MemoryLog::new();
    let snapshots = MemorySnapshotStore::shared();
    let manager = start_manager(fast_config(), &log, &snapshots);

    let (index, result) = commit(
        &log,
        &manager,
        LogEntry::CloseSession(CloseSessionEntry {
            timestamp: 10,
            session_id: SessionId::new(42),
            expired: false,
            delete: false,
        }),
    );
    assert_eq!(
        result.unwrap_err(),
        StateMachineError::UnknownSession(SessionId::new(42))
    );
    assert_eq!(manager.last_applied(), index);

    manager.shutdown();
}

#[test]
fn malformed_keep_alive_is_a_protocol_error() {
    let log = MemoryLog::new();
    let snapshots = MemorySnapshotStore::shared();
    let manager = start_manager(fast_config(), &log, &snapshots);

    commit(&log, &manager, open_session_entry("a", 10, 5_000));
    let (_, result) = commit(
        &log,
        &manager,
        LogEntry::KeepAlive(KeepAliveEntry {
            timestamp: 11,
            session_ids: vec![SessionId::new(1)],
            command_sequences: vec![],
            event_indexes: vec![0],
        }),
    );
    assert!(matches!(
        result.unwrap_err(),
        StateMachineError::Protocol(_)
    ));

    manager.shutdown();
}

#[test]
fn commands_against_a_deleted_service_report_unknown_session() {
    let log = MemoryLog::new();
    let snapshots = MemorySnapshotStore::shared();
    let manager = start_manager(fast_config(), &log, &snapshots);

    commit(&log, &manager, open_session_entry("a", 10, 1_000)); // 1
    commit(&log, &manager, open_session_entry("a", 10, 1_000)); // 2
    let (_, closed) = commit(
        &log,
        &manager,
        LogEntry::CloseSession(CloseSessionEntry {
            timestamp: 11,
            session_id: SessionId::new(1),
            expired: false,
            delete: true,
        }),
    );
    closed.unwrap();

    // Session 2 still exists but its service is gone.
    let (_, result) = commit(&log, &manager, command_entry(2, 1, "put", "k=v", 12));
    assert_eq!(
        result.unwrap_err(),
        StateMachineError::UnknownSession(SessionId::new(2))
    );

    manager.shutdown();
}
