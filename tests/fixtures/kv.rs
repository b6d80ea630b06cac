#![allow(dead_code)]

//! Key-value test service and manager harness.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use tiller_rs::core::operation;
use tiller_rs::manager::MemorySnapshotStore;
use tiller_rs::{
    ApplyFuture, ApplyOutput, ApplyResult, CommandEntry, Commit, Config, LogEntry, MemberId,
    MemoryLog, OpenSessionEntry, QueryContext, ReadConsistency, Service, ServiceFailure,
    ServiceKind, ServiceManager, ServiceName, SessionId,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Deterministic map service.
///
/// Commands: `put` ("k=v", returns prior value), `del` ("k"), `announce`
/// (publishes the input as a session event). Queries: `get` ("k"), `len`.
pub struct KvService {
    entries: BTreeMap<String, String>,
}

impl KvService {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn boxed() -> Box<dyn Service> {
        Box::new(Self::new())
    }
}

impl Service for KvService {
    fn execute(&mut self, commit: &mut Commit<'_>) -> Result<Bytes, ServiceFailure> {
        let input = String::from_utf8_lossy(&commit.operation.input).into_owned();
        match commit.operation.name.as_str() {
            "put" => {
                let (key, value) = input
                    .split_once('=')
                    .ok_or_else(|| ServiceFailure::new("put expects k=v"))?;
                let prior = self.entries.insert(key.to_string(), value.to_string());
                Ok(Bytes::from(prior.unwrap_or_default()))
            }
            "del" => {
                let prior = self.entries.remove(&input);
                Ok(Bytes::from(prior.unwrap_or_default()))
            }
            "announce" => {
                commit.publish(Bytes::from(input));
                Ok(Bytes::new())
            }
            other => Err(ServiceFailure::new(format!("unknown command {other}"))),
        }
    }

    fn query(&self, context: &QueryContext<'_>) -> Result<Bytes, ServiceFailure> {
        let input = String::from_utf8_lossy(&context.operation.input).into_owned();
        match context.operation.name.as_str() {
            "get" => Ok(Bytes::from(
                self.entries.get(&input).cloned().unwrap_or_default(),
            )),
            "len" => Ok(Bytes::from(self.entries.len().to_string())),
            other => Err(ServiceFailure::new(format!("unknown query {other}"))),
        }
    }

    fn take_snapshot(&self) -> Bytes {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        Bytes::from(out)
    }

    fn install_snapshot(&mut self, data: &[u8]) -> Result<(), ServiceFailure> {
        let text =
            std::str::from_utf8(data).map_err(|_| ServiceFailure::new("snapshot is not utf-8"))?;
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ServiceFailure::new("snapshot line is not k=v"))?;
            entries.insert(key.to_string(), value.to_string());
        }
        self.entries = entries;
        Ok(())
    }
}

/// Config with short delays so cycles finish within test time. The periodic
/// interval stays long: tests drive cycles explicitly through `compact()`
/// unless they opt in to the timer.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.snapshot.interval_ms = 60_000;
    config.snapshot.completion_delay_ms = 10;
    config.snapshot.compact_delay_ms = 10;
    config.snapshot.max_completion_rounds = 100;
    config.load.window_ms = 1_000;
    config.load.high_load_threshold = 1_000_000;
    config.session.default_timeout_ms = 60_000;
    config
}

pub fn start_manager(
    config: Config,
    log: &MemoryLog,
    snapshots: &Arc<MemorySnapshotStore>,
) -> ServiceManager {
    ServiceManager::builder(config, Arc::new(log.clone()))
        .snapshots(snapshots.clone())
        .register_service(ServiceKind::new("kv").unwrap(), KvService::boxed)
        .start()
}

pub fn open_session_entry(name: &str, timestamp: u64, timeout_ms: u64) -> LogEntry {
    LogEntry::OpenSession(OpenSessionEntry {
        timestamp,
        member_id: MemberId::new("node-1").unwrap(),
        service_name: ServiceName::new(name).unwrap(),
        service_kind: ServiceKind::new("kv").unwrap(),
        read_consistency: ReadConsistency::Linearizable,
        timeout_ms,
    })
}

pub fn command_entry(session: u64, sequence: u64, op: &str, input: &str, timestamp: u64) -> LogEntry {
    LogEntry::Command(CommandEntry {
        timestamp,
        session_id: SessionId::new(session),
        sequence,
        operation: operation(op, Bytes::from(input.to_string())),
    })
}

/// Appends and applies one entry, returning `(index, result)`.
pub fn commit(log: &MemoryLog, manager: &ServiceManager, entry: LogEntry) -> (u64, ApplyResult) {
    let indexed = log.append(entry);
    let result = wait(manager.apply(indexed.index));
    (indexed.index, result)
}

pub fn wait(future: ApplyFuture) -> ApplyResult {
    future.wait_timeout(WAIT).expect("apply future timed out")
}

pub fn output_bytes(result: ApplyResult) -> Bytes {
    match result.expect("apply failed") {
        ApplyOutput::Operation(op) => op.result.expect("operation failed"),
        other => panic!("expected operation output, got {other:?}"),
    }
}
