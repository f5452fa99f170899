//! pgoutput wire decoding.
//!
//! A replication connection delivers CopyData payloads of two kinds:
//!
//! ```text
//! 'w' XLogData   wal_start:u64 wal_end:u64 send_time:i64 <pgoutput message>
//! 'k' Keepalive  wal_end:u64 send_time:i64 reply_requested:u8
//! ```
//!
//! The pgoutput message carried by XLogData is decoded into a
//! [`LogicalMessage`]. Every field read is bounds-checked: truncated or
//! garbled input produces [`SyncError::Decode`], never a panic.
//!
//! The decoder is stateful only for streamed (in-progress) transactions:
//! between Stream Start and Stream Stop, row messages carry an extra xid
//! field after the message type.

use crate::error::{Result, SyncError};
use crate::event::{ColumnValue, Lsn};
use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Convert a PostgreSQL timestamp (µs since 2000-01-01) to UTC.
pub fn pg_timestamp(micros: i64) -> Result<DateTime<Utc>> {
    micros
        .checked_add(PG_EPOCH_OFFSET_MICROS)
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .ok_or_else(|| SyncError::decode(format!("timestamp out of range: {}", micros)))
}

/// Convert UTC to a PostgreSQL timestamp.
pub fn to_pg_timestamp(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

// =============================================================================
// Message types
// =============================================================================

/// A decoded CopyData payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        send_time: DateTime<Utc>,
        message: LogicalMessage,
    },
    Keepalive {
        wal_end: Lsn,
        send_time: DateTime<Utc>,
        reply_requested: bool,
    },
}

/// Column description from a Relation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    pub is_key: bool,
}

/// Relation (table schema) message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

/// Which old row image accompanies an update or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldImageKind {
    /// 'K': replica identity key columns only.
    Key,
    /// 'O': the full old row (REPLICA IDENTITY FULL).
    Full,
}

/// Old row sent with an update or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldTuple {
    pub kind: OldImageKind,
    pub values: Vec<ColumnValue>,
}

/// A pgoutput logical replication message.
///
/// `xid` fields are only present inside a streamed transaction block.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        commit_timestamp: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_timestamp: DateTime<Utc>,
    },
    Origin {
        commit_lsn: Lsn,
        name: String,
    },
    Relation {
        xid: Option<u32>,
        relation: Relation,
    },
    Type {
        xid: Option<u32>,
        oid: u32,
        namespace: String,
        name: String,
    },
    Insert {
        xid: Option<u32>,
        relation_id: u32,
        new: Vec<ColumnValue>,
    },
    Update {
        xid: Option<u32>,
        relation_id: u32,
        old: Option<OldTuple>,
        new: Vec<ColumnValue>,
    },
    Delete {
        xid: Option<u32>,
        relation_id: u32,
        old: OldTuple,
    },
    Truncate {
        xid: Option<u32>,
        options: u8,
        relation_ids: Vec<u32>,
    },
    Message {
        xid: Option<u32>,
        transactional: bool,
        lsn: Lsn,
        prefix: String,
        content: Bytes,
    },
    StreamStart {
        xid: u32,
        first_segment: bool,
    },
    StreamStop,
    StreamCommit {
        xid: u32,
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_timestamp: DateTime<Utc>,
    },
    StreamAbort {
        xid: u32,
        subxid: u32,
    },
}

impl LogicalMessage {
    /// Single-letter tag, for logs.
    pub fn tag(&self) -> char {
        match self {
            LogicalMessage::Begin { .. } => 'B',
            LogicalMessage::Commit { .. } => 'C',
            LogicalMessage::Origin { .. } => 'O',
            LogicalMessage::Relation { .. } => 'R',
            LogicalMessage::Type { .. } => 'Y',
            LogicalMessage::Insert { .. } => 'I',
            LogicalMessage::Update { .. } => 'U',
            LogicalMessage::Delete { .. } => 'D',
            LogicalMessage::Truncate { .. } => 'T',
            LogicalMessage::Message { .. } => 'M',
            LogicalMessage::StreamStart { .. } => 'S',
            LogicalMessage::StreamStop => 'E',
            LogicalMessage::StreamCommit { .. } => 'c',
            LogicalMessage::StreamAbort { .. } => 'A',
        }
    }
}

// =============================================================================
// Bounds-checked field reader
// =============================================================================

struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, field: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(SyncError::decode(format!(
                "truncated {}: need {} bytes, have {}",
                field,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, field: &str) -> Result<u8> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &str) -> Result<u16> {
        self.need(2, field)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, field: &str) -> Result<u32> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self, field: &str) -> Result<i32> {
        self.need(4, field)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self, field: &str) -> Result<u64> {
        self.need(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self, field: &str) -> Result<i64> {
        self.need(8, field)?;
        Ok(self.buf.get_i64())
    }

    fn lsn(&mut self, field: &str) -> Result<Lsn> {
        self.u64(field).map(Lsn)
    }

    fn timestamp(&mut self, field: &str) -> Result<DateTime<Utc>> {
        pg_timestamp(self.i64(field)?)
    }

    fn bytes(&mut self, n: usize, field: &str) -> Result<Bytes> {
        self.need(n, field)?;
        Ok(self.buf.split_to(n))
    }

    /// NUL-terminated string.
    fn cstr(&mut self, field: &str) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| SyncError::decode(format!("unterminated string in {}", field)))?;
        let raw = self.buf.split_to(end);
        self.buf.advance(1);
        String::from_utf8(raw.to_vec())
            .map_err(|_| SyncError::decode(format!("invalid UTF-8 in {}", field)))
    }

    fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn finish(&self, what: &str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(SyncError::decode(format!(
                "{} trailing bytes after {} message",
                self.remaining(),
                what
            )))
        }
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Decoder for CopyData frames carrying pgoutput messages.
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    /// Inside a Stream Start / Stream Stop block.
    in_stream: bool,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the decoder is inside a streamed transaction block.
    pub fn in_stream(&self) -> bool {
        self.in_stream
    }

    /// Decode one CopyData payload.
    pub fn decode_frame(&mut self, frame: Bytes) -> Result<WireMessage> {
        let mut r = FieldReader::new(frame);
        match r.u8("frame type")? {
            b'w' => {
                let wal_start = r.lsn("xlogdata wal_start")?;
                let wal_end = r.lsn("xlogdata wal_end")?;
                let send_time = r.timestamp("xlogdata send_time")?;
                let message = self.decode_message(r.buf)?;
                Ok(WireMessage::XLogData {
                    wal_start,
                    wal_end,
                    send_time,
                    message,
                })
            }
            b'k' => {
                let wal_end = r.lsn("keepalive wal_end")?;
                let send_time = r.timestamp("keepalive send_time")?;
                let reply_requested = r.u8("keepalive reply")? != 0;
                r.finish("keepalive")?;
                Ok(WireMessage::Keepalive {
                    wal_end,
                    send_time,
                    reply_requested,
                })
            }
            other => Err(SyncError::decode(format!(
                "unknown CopyData frame type 0x{:02x}",
                other
            ))),
        }
    }

    /// Decode one pgoutput message.
    pub fn decode_message(&mut self, body: Bytes) -> Result<LogicalMessage> {
        let mut r = FieldReader::new(body);
        let tag = r.u8("message type")?;
        let msg = match tag {
            b'B' => LogicalMessage::Begin {
                final_lsn: r.lsn("begin final_lsn")?,
                commit_timestamp: r.timestamp("begin timestamp")?,
                xid: r.u32("begin xid")?,
            },
            b'C' => LogicalMessage::Commit {
                flags: r.u8("commit flags")?,
                commit_lsn: r.lsn("commit lsn")?,
                end_lsn: r.lsn("commit end_lsn")?,
                commit_timestamp: r.timestamp("commit timestamp")?,
            },
            b'O' => LogicalMessage::Origin {
                commit_lsn: r.lsn("origin lsn")?,
                name: r.cstr("origin name")?,
            },
            b'R' => {
                let xid = self.stream_xid(&mut r)?;
                LogicalMessage::Relation {
                    xid,
                    relation: decode_relation(&mut r)?,
                }
            }
            b'Y' => LogicalMessage::Type {
                xid: self.stream_xid(&mut r)?,
                oid: r.u32("type oid")?,
                namespace: r.cstr("type namespace")?,
                name: r.cstr("type name")?,
            },
            b'I' => {
                let xid = self.stream_xid(&mut r)?;
                let relation_id = r.u32("insert relation")?;
                match r.u8("insert tuple marker")? {
                    b'N' => {}
                    other => {
                        return Err(SyncError::decode(format!(
                            "insert: expected 'N' tuple, got 0x{:02x}",
                            other
                        )))
                    }
                }
                LogicalMessage::Insert {
                    xid,
                    relation_id,
                    new: decode_tuple(&mut r)?,
                }
            }
            b'U' => {
                let xid = self.stream_xid(&mut r)?;
                let relation_id = r.u32("update relation")?;
                let (old, new) = match r.u8("update tuple marker")? {
                    b'N' => (None, decode_tuple(&mut r)?),
                    marker @ (b'K' | b'O') => {
                        let old = OldTuple {
                            kind: old_kind(marker),
                            values: decode_tuple(&mut r)?,
                        };
                        match r.u8("update new tuple marker")? {
                            b'N' => (Some(old), decode_tuple(&mut r)?),
                            other => {
                                return Err(SyncError::decode(format!(
                                    "update: expected 'N' after old tuple, got 0x{:02x}",
                                    other
                                )))
                            }
                        }
                    }
                    other => {
                        return Err(SyncError::decode(format!(
                            "update: unexpected tuple marker 0x{:02x}",
                            other
                        )))
                    }
                };
                LogicalMessage::Update {
                    xid,
                    relation_id,
                    old,
                    new,
                }
            }
            b'D' => {
                let xid = self.stream_xid(&mut r)?;
                let relation_id = r.u32("delete relation")?;
                let kind = match r.u8("delete tuple marker")? {
                    marker @ (b'K' | b'O') => old_kind(marker),
                    other => {
                        return Err(SyncError::decode(format!(
                            "delete: expected 'K' or 'O' tuple, got 0x{:02x}",
                            other
                        )))
                    }
                };
                LogicalMessage::Delete {
                    xid,
                    relation_id,
                    old: OldTuple {
                        kind,
                        values: decode_tuple(&mut r)?,
                    },
                }
            }
            b'T' => {
                let xid = self.stream_xid(&mut r)?;
                let count = r.u32("truncate relation count")? as usize;
                let options = r.u8("truncate options")?;
                r.need(count.saturating_mul(4), "truncate relation ids")?;
                let mut relation_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    relation_ids.push(r.u32("truncate relation id")?);
                }
                LogicalMessage::Truncate {
                    xid,
                    options,
                    relation_ids,
                }
            }
            b'M' => {
                let xid = self.stream_xid(&mut r)?;
                let transactional = r.u8("message flags")? & 1 == 1;
                let lsn = r.lsn("message lsn")?;
                let prefix = r.cstr("message prefix")?;
                let len = r.u32("message length")? as usize;
                LogicalMessage::Message {
                    xid,
                    transactional,
                    lsn,
                    prefix,
                    content: r.bytes(len, "message content")?,
                }
            }
            b'S' => {
                if self.in_stream {
                    return Err(SyncError::decode("stream start inside an open stream block"));
                }
                let xid = r.u32("stream start xid")?;
                let first_segment = r.u8("stream start first_segment")? == 1;
                self.in_stream = true;
                LogicalMessage::StreamStart { xid, first_segment }
            }
            b'E' => {
                if !self.in_stream {
                    return Err(SyncError::decode("stream stop without stream start"));
                }
                self.in_stream = false;
                LogicalMessage::StreamStop
            }
            b'c' => LogicalMessage::StreamCommit {
                xid: r.u32("stream commit xid")?,
                flags: r.u8("stream commit flags")?,
                commit_lsn: r.lsn("stream commit lsn")?,
                end_lsn: r.lsn("stream commit end_lsn")?,
                commit_timestamp: r.timestamp("stream commit timestamp")?,
            },
            b'A' => {
                let msg = LogicalMessage::StreamAbort {
                    xid: r.u32("stream abort xid")?,
                    subxid: r.u32("stream abort subxid")?,
                };
                // Protocol v4 appends abort lsn and timestamp; we have no use for them.
                if r.remaining() == 16 {
                    r.bytes(16, "stream abort position")?;
                }
                msg
            }
            other => {
                return Err(SyncError::decode(format!(
                    "unknown pgoutput message type 0x{:02x}",
                    other
                )))
            }
        };
        r.finish(&format!("'{}'", msg.tag()))?;
        Ok(msg)
    }

    fn stream_xid(&self, r: &mut FieldReader) -> Result<Option<u32>> {
        if self.in_stream {
            r.u32("streamed xid").map(Some)
        } else {
            Ok(None)
        }
    }
}

fn old_kind(marker: u8) -> OldImageKind {
    if marker == b'K' {
        OldImageKind::Key
    } else {
        OldImageKind::Full
    }
}

fn decode_relation(r: &mut FieldReader) -> Result<Relation> {
    let id = r.u32("relation id")?;
    let namespace = r.cstr("relation namespace")?;
    let name = r.cstr("relation name")?;
    let replica_identity = r.u8("relation replica identity")?;
    let count = r.u16("relation column count")? as usize;
    let mut columns = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        let flags = r.u8("column flags")?;
        columns.push(RelationColumn {
            name: r.cstr("column name")?,
            type_oid: r.u32("column type")?,
            type_modifier: r.i32("column type modifier")?,
            is_key: flags & 1 == 1,
        });
    }
    Ok(Relation {
        id,
        namespace: if namespace.is_empty() {
            // pg_catalog relations are sent with an empty namespace
            "pg_catalog".to_string()
        } else {
            namespace
        },
        name,
        replica_identity,
        columns,
    })
}

fn decode_tuple(r: &mut FieldReader) -> Result<Vec<ColumnValue>> {
    let count = r.u16("tuple column count")? as usize;
    let mut values = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        let value = match r.u8("tuple column kind")? {
            b'n' => ColumnValue::Null,
            b'u' => ColumnValue::Unchanged,
            b't' => {
                let len = r.u32("tuple column length")? as usize;
                let raw = r.bytes(len, "tuple column data")?;
                let text = String::from_utf8(raw.to_vec())
                    .map_err(|_| SyncError::decode("invalid UTF-8 in text column"))?;
                ColumnValue::Text(text)
            }
            b'b' => {
                return Err(SyncError::decode(
                    "binary tuple data is not supported; disable the binary publication option",
                ))
            }
            other => {
                return Err(SyncError::decode(format!(
                    "unknown tuple column kind 0x{:02x}",
                    other
                )))
            }
        };
        values.push(value);
    }
    Ok(values)
}
