//! Snapshot objects, store contract, and the framed stream codec.
//!
//! A snapshot is a concatenation of length-delimited per-service records,
//! ordered by service registration. Each frame is `magic + u32 len + crc32c`
//! over a CBOR map body; decoders skip unknown map keys, so newer writers
//! can extend records without breaking older readers.

use std::convert::Infallible;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use crc32c::crc32c;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{MemberId, ReadConsistency, ServiceId, ServiceKind, ServiceName, SessionId};

use super::session::Session;

const FRAME_MAGIC: u32 = 0x544C_5231; // "TLR1"
const FRAME_HEADER_LEN: usize = 12;

/// Default cap on a single service record.
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame magic mismatch (got {got:#x})")]
    FrameMagicMismatch { got: u32 },
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame crc mismatch (expected {expected:#x}, got {got:#x})")]
    FrameCrcMismatch { expected: u32, got: u32 },
    #[error("record too large: {got_bytes} bytes (max {max_bytes})")]
    RecordTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("record field {field} invalid: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("record missing required field: {0}")]
    MissingField(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

type SnapshotResult<T> = Result<T, SnapshotError>;

/// A finalized snapshot. Cheap to clone; the data is shared.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub index: u64,
    pub timestamp: u64,
    pub data: Bytes,
}

impl Snapshot {
    pub fn reader(&self) -> SnapshotReader<&[u8]> {
        SnapshotReader::new(self.data.as_ref())
    }
}

/// A snapshot being written. Dropped without [`Self::finish`] it is
/// abandoned.
pub struct PendingSnapshot {
    index: u64,
    timestamp: u64,
    buf: Vec<u8>,
}

impl PendingSnapshot {
    pub fn new(index: u64, timestamp: u64) -> Self {
        Self {
            index,
            timestamp,
            buf: Vec::new(),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn write_record(&mut self, record: &ServiceRecord) -> SnapshotResult<()> {
        let mut writer = SnapshotWriter::new(&mut self.buf);
        writer.write_record(record)
    }

    pub fn finish(self) -> Snapshot {
        Snapshot {
            index: self.index,
            timestamp: self.timestamp,
            data: Bytes::from(self.buf),
        }
    }
}

/// Holds the current snapshot used for install/skip decisions. Only
/// finalized snapshots are visible here.
pub trait SnapshotStore: Send + Sync {
    fn current(&self) -> Option<Snapshot>;
    fn commit(&self, snapshot: Snapshot);
}

/// In-memory store retaining the highest-index snapshot.
#[derive(Default)]
pub struct MemorySnapshotStore {
    current: Mutex<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn current(&self) -> Option<Snapshot> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn commit(&self, snapshot: Snapshot) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match &*current {
            Some(existing) if existing.index >= snapshot.index => {}
            _ => *current = Some(snapshot),
        }
    }
}

/// One session serialized alongside its service, so a restored replica can
/// keep deduplicating and expiring without replaying the covered prefix.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub member_id: MemberId,
    pub read_consistency: ReadConsistency,
    pub timeout_ms: u64,
    pub last_updated: u64,
    pub command_sequence: u64,
    pub event_index: u64,
}

impl SessionRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.session_id(),
            member_id: session.member_id().clone(),
            read_consistency: session.read_consistency(),
            timeout_ms: session.timeout_ms(),
            last_updated: session.last_updated(),
            command_sequence: session.command_sequence(),
            event_index: session.event_index(),
        }
    }
}

/// One service's sub-snapshot. The body is opaque to the core.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceRecord {
    pub service_id: ServiceId,
    pub kind: ServiceKind,
    pub name: ServiceName,
    pub sessions: Vec<SessionRecord>,
    pub body: Bytes,
}

impl ServiceRecord {
    fn encode_body(&self) -> SnapshotResult<Vec<u8>> {
        let mut e = Encoder::new(Vec::new());
        e.map(5)?;
        e.str("id")?.u64(self.service_id.get())?;
        e.str("kind")?.str(self.kind.as_str())?;
        e.str("name")?.str(self.name.as_str())?;
        e.str("sessions")?;
        e.array(self.sessions.len() as u64)?;
        for session in &self.sessions {
            e.map(7)?;
            e.str("id")?.u64(session.session_id.get())?;
            e.str("member")?.str(session.member_id.as_str())?;
            e.str("consistency")?
                .str(consistency_str(session.read_consistency))?;
            e.str("timeout")?.u64(session.timeout_ms)?;
            e.str("updated")?.u64(session.last_updated)?;
            e.str("sequence")?.u64(session.command_sequence)?;
            e.str("events")?.u64(session.event_index)?;
        }
        e.str("body")?.bytes(&self.body)?;
        Ok(e.into_writer())
    }

    fn decode_body(body: &[u8]) -> SnapshotResult<Self> {
        let mut d = Decoder::new(body);
        let len = d.map()?.ok_or(SnapshotError::IndefiniteLength)?;

        let mut service_id = None;
        let mut kind = None;
        let mut name = None;
        let mut sessions = Vec::new();
        let mut record_body = None;

        for _ in 0..len {
            match d.str()? {
                "id" => service_id = Some(ServiceId::new(d.u64()?)),
                "kind" => {
                    kind = Some(ServiceKind::new(d.str()?).map_err(|e| {
                        SnapshotError::InvalidField {
                            field: "kind",
                            reason: e.to_string(),
                        }
                    })?)
                }
                "name" => {
                    name = Some(ServiceName::new(d.str()?).map_err(|e| {
                        SnapshotError::InvalidField {
                            field: "name",
                            reason: e.to_string(),
                        }
                    })?)
                }
                "sessions" => {
                    let count = d.array()?.ok_or(SnapshotError::IndefiniteLength)?;
                    for _ in 0..count {
                        sessions.push(decode_session(&mut d)?);
                    }
                }
                "body" => record_body = Some(Bytes::copy_from_slice(d.bytes()?)),
                _ => d.skip()?,
            }
        }

        Ok(Self {
            service_id: service_id.ok_or(SnapshotError::MissingField("id"))?,
            kind: kind.ok_or(SnapshotError::MissingField("kind"))?,
            name: name.ok_or(SnapshotError::MissingField("name"))?,
            sessions,
            body: record_body.ok_or(SnapshotError::MissingField("body"))?,
        })
    }
}

fn decode_session(d: &mut Decoder<'_>) -> SnapshotResult<SessionRecord> {
    let len = d.map()?.ok_or(SnapshotError::IndefiniteLength)?;

    let mut session_id = None;
    let mut member_id = None;
    let mut read_consistency = None;
    let mut timeout_ms = None;
    let mut last_updated = 0;
    let mut command_sequence = 0;
    let mut event_index = 0;

    for _ in 0..len {
        match d.str()? {
            "id" => session_id = Some(SessionId::new(d.u64()?)),
            "member" => {
                member_id =
                    Some(
                        MemberId::new(d.str()?).map_err(|e| SnapshotError::InvalidField {
                            field: "member",
                            reason: e.to_string(),
                        })?,
                    )
            }
            "consistency" => {
                let raw = d.str()?;
                read_consistency =
                    Some(
                        parse_consistency(raw).ok_or_else(|| SnapshotError::InvalidField {
                            field: "consistency",
                            reason: format!("unknown level {raw}"),
                        })?,
                    );
            }
            "timeout" => timeout_ms = Some(d.u64()?),
            "updated" => last_updated = d.u64()?,
            "sequence" => command_sequence = d.u64()?,
            "events" => event_index = d.u64()?,
            _ => d.skip()?,
        }
    }

    Ok(SessionRecord {
        session_id: session_id.ok_or(SnapshotError::MissingField("session id"))?,
        member_id: member_id.ok_or(SnapshotError::MissingField("member"))?,
        read_consistency: read_consistency.ok_or(SnapshotError::MissingField("consistency"))?,
        timeout_ms: timeout_ms.ok_or(SnapshotError::MissingField("timeout"))?,
        last_updated,
        command_sequence,
        event_index,
    })
}

fn consistency_str(level: ReadConsistency) -> &'static str {
    match level {
        ReadConsistency::Sequential => "sequential",
        ReadConsistency::LinearizableLease => "linearizable_lease",
        ReadConsistency::Linearizable => "linearizable",
    }
}

fn parse_consistency(raw: &str) -> Option<ReadConsistency> {
    match raw {
        "sequential" => Some(ReadConsistency::Sequential),
        "linearizable_lease" => Some(ReadConsistency::LinearizableLease),
        "linearizable" => Some(ReadConsistency::Linearizable),
        _ => None,
    }
}

pub struct SnapshotWriter<W> {
    writer: W,
    max_record_bytes: usize,
}

impl<W: Write> SnapshotWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            max_record_bytes: MAX_RECORD_BYTES,
        }
    }

    pub fn write_record(&mut self, record: &ServiceRecord) -> SnapshotResult<()> {
        let body = record.encode_body()?;
        if body.len() > self.max_record_bytes {
            return Err(SnapshotError::RecordTooLarge {
                max_bytes: self.max_record_bytes,
                got_bytes: body.len(),
            });
        }
        let length =
            u32::try_from(body.len()).map_err(|_| SnapshotError::FrameLengthInvalid {
                reason: "frame length exceeds u32".to_string(),
            })?;
        let crc = crc32c(&body);

        self.writer.write_all(&FRAME_MAGIC.to_le_bytes())?;
        self.writer.write_all(&length.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&body)?;
        Ok(())
    }
}

pub struct SnapshotReader<R> {
    reader: R,
    max_record_bytes: usize,
}

impl<R: Read> SnapshotReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_record_bytes: MAX_RECORD_BYTES,
        }
    }

    /// Reads the next record; `Ok(None)` at a clean end of stream.
    pub fn read_record(&mut self) -> SnapshotResult<Option<ServiceRecord>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(SnapshotError::FrameLengthInvalid {
                    reason: "truncated frame header".to_string(),
                });
            }
            read += n;
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != FRAME_MAGIC {
            return Err(SnapshotError::FrameMagicMismatch { got: magic });
        }

        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length == 0 {
            return Err(SnapshotError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_record_bytes {
            return Err(SnapshotError::RecordTooLarge {
                max_bytes: self.max_record_bytes,
                got_bytes: length,
            });
        }

        let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body)?;

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(SnapshotError::FrameCrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }

        ServiceRecord::decode_body(&body).map(Some)
    }
}
