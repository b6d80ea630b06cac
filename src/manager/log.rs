//! Compaction-facing view of the replicated log.
//!
//! The log itself is owned by the consensus layer; this module only carries
//! the reader and compaction seams the state machine needs, plus an
//! in-memory implementation for tests and embedders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Indexed, LogEntry};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("index {index} is outside the log (first {first}, last {last})")]
    OutOfRange { index: u64, first: u64, last: u64 },
    #[error("log read failed: {0}")]
    Read(String),
}

/// Sequential reader over committed entries. The cursor has a single owner.
pub trait LogReader: Send {
    fn first_index(&self) -> u64;
    /// Index the next `next()` call will return.
    fn next_index(&self) -> u64;
    fn has_next(&self) -> bool;
    fn next(&mut self) -> Result<Indexed<LogEntry>, LogError>;
}

/// The slice of the log contract the state machine uses.
pub trait RaftLog: Send + Sync {
    fn open_reader(&self, from_index: u64) -> Box<dyn LogReader>;
    fn first_index(&self) -> u64;
    fn last_index(&self) -> u64;
    /// Whether compaction below `index` would actually release anything.
    fn is_compactable(&self, index: u64) -> bool;
    /// Highest index at which the log could be truncated given entries up to
    /// `index` are applied.
    fn compactable_index(&self, index: u64) -> u64;
    fn compact(&self, index: u64) -> Result<(), LogError>;
}

/// Where log segments live; memory-backed levels add memory pressure to the
/// compaction policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLevel {
    #[default]
    Disk,
    Mapped,
    Memory,
}

impl StorageLevel {
    pub fn is_memory_backed(self) -> bool {
        matches!(self, StorageLevel::Mapped | StorageLevel::Memory)
    }
}

/// Point-in-time space measurements feeding the pressure signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceStats {
    pub usable_disk: u64,
    pub total_disk: u64,
    pub free_memory: u64,
    pub total_memory: u64,
}

impl SpaceStats {
    /// Roomy defaults for embedders that do not meter space.
    pub fn unbounded() -> Self {
        Self {
            usable_disk: u64::MAX / 2,
            total_disk: u64::MAX / 2,
            free_memory: u64::MAX / 2,
            total_memory: u64::MAX / 2,
        }
    }
}

/// Supplies space measurements at snapshot-decision time.
pub trait SpaceSource: Send + Sync {
    fn stats(&self) -> SpaceStats;
}

/// Fixed measurements, for tests and embedders without metering.
pub struct FixedSpace(pub SpaceStats);

impl SpaceSource for FixedSpace {
    fn stats(&self) -> SpaceStats {
        self.0
    }
}

struct MemoryLogInner {
    first_index: u64,
    entries: VecDeque<Indexed<LogEntry>>,
}

impl MemoryLogInner {
    fn last_index(&self) -> u64 {
        self.first_index + self.entries.len() as u64 - 1
    }

    fn get(&self, index: u64) -> Option<&Indexed<LogEntry>> {
        if index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }
}

/// In-memory log with gap-free indices starting at 1.
///
/// Compaction granularity is per-entry, so `compactable_index` is the
/// applied index itself.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Mutex<MemoryLogInner>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryLogInner {
                first_index: 1,
                entries: VecDeque::new(),
            })),
        }
    }

    /// Appends an entry, assigning the next index.
    pub fn append(&self, entry: LogEntry) -> Indexed<LogEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let index = inner.first_index + inner.entries.len() as u64;
        let indexed = Indexed::new(index, entry);
        inner.entries.push_back(indexed.clone());
        indexed
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog for MemoryLog {
    fn open_reader(&self, from_index: u64) -> Box<dyn LogReader> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let next_index = from_index.max(inner.first_index);
        drop(inner);
        Box::new(MemoryLogReader {
            inner: Arc::clone(&self.inner),
            next_index,
        })
    }

    fn first_index(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .first_index
    }

    fn last_index(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.is_empty() {
            inner.first_index - 1
        } else {
            inner.last_index()
        }
    }

    fn is_compactable(&self, index: u64) -> bool {
        index > self.first_index()
    }

    fn compactable_index(&self, index: u64) -> u64 {
        index
    }

    fn compact(&self, index: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while inner.first_index < index {
            if inner.entries.pop_front().is_none() {
                break;
            }
            inner.first_index += 1;
        }
        Ok(())
    }
}

struct MemoryLogReader {
    inner: Arc<Mutex<MemoryLogInner>>,
    next_index: u64,
}

impl LogReader for MemoryLogReader {
    fn first_index(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .first_index
    }

    fn next_index(&self) -> u64 {
        self.next_index
    }

    fn has_next(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(self.next_index).is_some()
    }

    fn next(&mut self) -> Result<Indexed<LogEntry>, LogError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(indexed) = inner.get(self.next_index) else {
            return Err(LogError::OutOfRange {
                index: self.next_index,
                first: inner.first_index,
                last: if inner.entries.is_empty() {
                    inner.first_index - 1
                } else {
                    inner.last_index()
                },
            });
        };
        let indexed = indexed.clone();
        drop(inner);
        self.next_index += 1;
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InitializeEntry, LogEntry};

    fn heartbeat(ts: u64) -> LogEntry {
        LogEntry::Initialize(InitializeEntry { timestamp: ts })
    }

    #[test]
    fn append_assigns_gap_free_indices_from_one() {
        let log = MemoryLog::new();
        assert_eq!(log.append(heartbeat(1)).index, 1);
        assert_eq!(log.append(heartbeat(2)).index, 2);
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn reader_walks_in_order() {
        let log = MemoryLog::new();
        for ts in 1..=3 {
            log.append(heartbeat(ts));
        }
        let mut reader = log.open_reader(1);
        assert_eq!(reader.next().unwrap().index, 1);
        assert_eq!(reader.next().unwrap().index, 2);
        assert_eq!(reader.next_index(), 3);
        assert!(reader.has_next());
    }

    #[test]
    fn compact_drops_prefix_and_advances_first_index() {
        let log = MemoryLog::new();
        for ts in 1..=5 {
            log.append(heartbeat(ts));
        }
        log.compact(4).unwrap();
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.last_index(), 5);
        assert!(log.is_compactable(5));
        assert!(!log.is_compactable(4));

        let mut reader = log.open_reader(1);
        assert_eq!(reader.next_index(), 4);
        assert_eq!(reader.next().unwrap().index, 4);
    }

    #[test]
    fn read_past_end_is_out_of_range() {
        let log = MemoryLog::new();
        log.append(heartbeat(1));
        let mut reader = log.open_reader(1);
        reader.next().unwrap();
        assert!(!reader.has_next());
        assert!(matches!(
            reader.next(),
            Err(LogError::OutOfRange { index: 2, .. })
        ));
    }
}
