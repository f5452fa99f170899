// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change stream reader.
//!
//! Turns the raw frames of a logical replication connection into
//! [`StreamItem`]s: row changes tagged with their transaction, and commit
//! markers.
//!
//! # Restart Semantics
//!
//! The reader is constructed with the last checkpointed LSN. A transaction
//! whose commit LSN is at or below that position was already applied, so
//! its Begin..Commit block is skipped without emitting anything.
//!
//! ```text
//! checkpoint = 0/200
//! B(final=0/180) I I C   → skipped
//! B(final=0/240) I U C   → emitted
//! ```
//!
//! Streamed transactions cannot be filtered at Begin (their commit LSN is
//! only known at Stream Commit); the ordering buffer drops those replays.
//!
//! # Relation Cache
//!
//! Row messages reference tables by relation id. The server sends a
//! Relation message before the first change to each table in a session
//! (and again after a schema change). A row for an unknown relation id means
//! the stream is out of sync with us, which is a decode error.
//!
//! # Keepalives
//!
//! The server asks for a reply periodically. The reader answers with the
//! last acknowledged (checkpointed) LSN, which is what lets the server
//! recycle WAL behind the slot.

pub mod decoder;
pub mod source;

pub use decoder::{LogicalMessage, PgOutputDecoder, WireMessage};
pub use source::{FrameLog, FrameLogSource, ReplicationSource, SourceConnector, StandbyStatus};

use crate::error::{Result, SyncError};
use crate::event::{ChangeEvent, ColumnValue, CommitMarker, Lsn, Operation, RowImage, TableId};
use crate::metrics;
use chrono::{DateTime, Utc};
use decoder::{OldImageKind, OldTuple, Relation};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace, warn};

/// One unit of output from the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A row change.
    ///
    /// `origin_xid` is the (sub)transaction that wrote the change. It equals
    /// `event.transaction_id` except inside streamed transactions, where it
    /// identifies the subtransaction for Stream Abort.
    Change { event: ChangeEvent, origin_xid: u32 },

    /// A transaction committed.
    Commit(CommitMarker),

    /// A streamed (sub)transaction rolled back.
    ///
    /// `subtransaction_id == transaction_id` aborts the whole transaction.
    Abort {
        transaction_id: u32,
        subtransaction_id: u32,
    },
}

impl StreamItem {
    pub fn transaction_id(&self) -> u32 {
        match self {
            StreamItem::Change { event, .. } => event.transaction_id,
            StreamItem::Commit(marker) => marker.transaction_id,
            StreamItem::Abort { transaction_id, .. } => *transaction_id,
        }
    }
}

// =============================================================================
// Relation cache
// =============================================================================

/// Cached table description for one relation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub table: TableId,
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
    /// Column name to type OID.
    pub column_types: BTreeMap<String, u32>,
}

/// Relation id to table description.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, RelationInfo>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relation: Relation) {
        let info = RelationInfo {
            table: TableId::new(relation.namespace, relation.name),
            key_columns: relation
                .columns
                .iter()
                .filter(|c| c.is_key)
                .map(|c| c.name.clone())
                .collect(),
            column_types: relation
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.type_oid))
                .collect(),
            columns: relation.columns.into_iter().map(|c| c.name).collect(),
        };
        debug!(
            relation_id = relation.id,
            table = %info.table,
            columns = info.columns.len(),
            "Relation registered"
        );
        self.relations.insert(relation.id, info);
    }

    pub fn get(&self, relation_id: u32) -> Result<&RelationInfo> {
        self.relations.get(&relation_id).ok_or_else(|| {
            SyncError::decode(format!("row for unknown relation id {}", relation_id))
        })
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Pair tuple values with column names.
    fn image(&self, info: &RelationInfo, values: Vec<ColumnValue>) -> Result<RowImage> {
        if values.len() != info.columns.len() {
            return Err(SyncError::decode(format!(
                "{}: tuple has {} columns, relation has {}",
                info.table,
                values.len(),
                info.columns.len()
            )));
        }
        Ok(info.columns.iter().cloned().zip(values).collect())
    }

    /// Old image, trimmed to key columns when the server sent only the key.
    fn old_image(&self, info: &RelationInfo, old: OldTuple) -> Result<RowImage> {
        let mut image = self.image(info, old.values)?;
        if old.kind == OldImageKind::Key {
            image.retain(|name, _| info.key_columns.contains(name));
        }
        Ok(image)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Transaction currently open in the (non-streamed) stream.
#[derive(Debug, Clone, Copy)]
struct OpenTransaction {
    xid: u32,
    final_lsn: Lsn,
    commit_timestamp: DateTime<Utc>,
    skip: bool,
}

/// Decodes a replication connection into [`StreamItem`]s.
pub struct StreamReader<S: ReplicationSource> {
    source: S,
    decoder: PgOutputDecoder,
    relations: RelationCache,
    /// Transactions committing at or below this were already applied.
    start_lsn: Lsn,
    /// Highest WAL position seen from the server.
    received_lsn: Lsn,
    /// Highest position durably checkpointed by the applier.
    flushed_lsn: Lsn,
    open: Option<OpenTransaction>,
    /// Top-level xid of the open streamed block.
    stream_xid: Option<u32>,
    /// Send time of the last XLogData frame, used as a provisional
    /// timestamp for streamed changes.
    last_send_time: DateTime<Utc>,
}

impl<S: ReplicationSource> StreamReader<S> {
    /// Create a reader that resumes after `start_lsn`.
    pub fn new(source: S, start_lsn: Lsn) -> Self {
        Self {
            source,
            decoder: PgOutputDecoder::new(),
            relations: RelationCache::new(),
            start_lsn,
            received_lsn: start_lsn,
            flushed_lsn: start_lsn,
            open: None,
            stream_xid: None,
            last_send_time: Utc::now(),
        }
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    pub fn received_lsn(&self) -> Lsn {
        self.received_lsn
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    /// Record that everything up to `lsn` is durably applied.
    ///
    /// Reported to the server on the next status update. Never moves back.
    pub fn acknowledge(&mut self, lsn: Lsn) {
        if lsn > self.flushed_lsn {
            self.flushed_lsn = lsn;
        }
    }

    /// Send a standby status update without reading anything.
    ///
    /// Used while paused so the server does not time out the connection.
    pub async fn keepalive(&mut self) -> Result<()> {
        self.send_status(false).await
    }

    async fn send_status(&mut self, reply_requested: bool) -> Result<()> {
        let status = StandbyStatus {
            received: self.received_lsn.max(self.flushed_lsn),
            flushed: self.flushed_lsn,
            applied: self.flushed_lsn,
            reply_requested,
        };
        trace!(flushed = %status.flushed, "Sending standby status");
        self.source.send_status(status).await
    }

    /// Read until the next change, commit or abort.
    ///
    /// Fails with [`SyncError::Connection`] if the server ends the stream and
    /// [`SyncError::Decode`] on malformed input.
    pub async fn next_item(&mut self) -> Result<StreamItem> {
        loop {
            let frame = self.source.next_frame().await?.ok_or_else(|| {
                SyncError::connection("source", "replication stream ended")
            })?;

            match self.decoder.decode_frame(frame)? {
                WireMessage::Keepalive {
                    wal_end,
                    reply_requested,
                    ..
                } => {
                    self.received_lsn = self.received_lsn.max(wal_end);
                    if reply_requested {
                        self.send_status(false).await?;
                    }
                }
                WireMessage::XLogData {
                    wal_start,
                    wal_end,
                    send_time,
                    message,
                } => {
                    self.received_lsn = self.received_lsn.max(wal_end);
                    self.last_send_time = send_time;
                    if let Some(item) = self.handle_message(wal_start, message)? {
                        if let StreamItem::Change { .. } = item {
                            metrics::record_events_read(1);
                        }
                        return Ok(item);
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, lsn: Lsn, message: LogicalMessage) -> Result<Option<StreamItem>> {
        match message {
            LogicalMessage::Begin {
                final_lsn,
                commit_timestamp,
                xid,
            } => {
                if let Some(open) = self.open {
                    return Err(SyncError::decode(format!(
                        "BEGIN for xid {} while xid {} is open",
                        xid, open.xid
                    )));
                }
                let skip = final_lsn <= self.start_lsn;
                if skip {
                    debug!(xid, final_lsn = %final_lsn, "Skipping already-applied transaction");
                }
                self.open = Some(OpenTransaction {
                    xid,
                    final_lsn,
                    commit_timestamp,
                    skip,
                });
                Ok(None)
            }
            LogicalMessage::Commit {
                commit_lsn,
                end_lsn,
                commit_timestamp,
                ..
            } => {
                let open = self
                    .open
                    .take()
                    .ok_or_else(|| SyncError::decode("COMMIT without BEGIN"))?;
                if commit_lsn != open.final_lsn {
                    return Err(SyncError::decode(format!(
                        "COMMIT at {} does not match BEGIN final LSN {}",
                        commit_lsn, open.final_lsn
                    )));
                }
                if open.skip {
                    return Ok(None);
                }
                Ok(Some(StreamItem::Commit(CommitMarker {
                    transaction_id: open.xid,
                    commit_lsn,
                    end_lsn,
                    commit_timestamp,
                })))
            }
            LogicalMessage::Relation { relation, .. } => {
                self.relations.insert(relation);
                Ok(None)
            }
            LogicalMessage::Insert {
                xid,
                relation_id,
                new,
            } => self.change(lsn, xid, relation_id, Operation::Insert, None, Some(new)),
            LogicalMessage::Update {
                xid,
                relation_id,
                old,
                new,
            } => self.change(lsn, xid, relation_id, Operation::Update, old, Some(new)),
            LogicalMessage::Delete {
                xid,
                relation_id,
                old,
            } => self.change(lsn, xid, relation_id, Operation::Delete, Some(old), None),
            LogicalMessage::Truncate { relation_ids, .. } => {
                let tables: Vec<String> = relation_ids
                    .iter()
                    .filter_map(|id| self.relations.get(*id).ok())
                    .map(|info| info.table.to_string())
                    .collect();
                warn!(tables = ?tables, "TRUNCATE is not replicated, skipping");
                metrics::record_truncate_skipped(tables.len());
                Ok(None)
            }
            LogicalMessage::StreamStart { xid, .. } => {
                self.stream_xid = Some(xid);
                Ok(None)
            }
            LogicalMessage::StreamStop => {
                self.stream_xid = None;
                Ok(None)
            }
            LogicalMessage::StreamCommit {
                xid,
                commit_lsn,
                end_lsn,
                commit_timestamp,
                ..
            } => Ok(Some(StreamItem::Commit(CommitMarker {
                transaction_id: xid,
                commit_lsn,
                end_lsn,
                commit_timestamp,
            }))),
            LogicalMessage::StreamAbort { xid, subxid } => Ok(Some(StreamItem::Abort {
                transaction_id: xid,
                subtransaction_id: subxid,
            })),
            other @ (LogicalMessage::Origin { .. }
            | LogicalMessage::Type { .. }
            | LogicalMessage::Message { .. }) => {
                trace!(tag = %other.tag(), "Ignoring message");
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn change(
        &mut self,
        lsn: Lsn,
        streamed_xid: Option<u32>,
        relation_id: u32,
        operation: Operation,
        old: Option<OldTuple>,
        new: Option<Vec<ColumnValue>>,
    ) -> Result<Option<StreamItem>> {
        let (transaction_id, origin_xid, commit_timestamp) = match streamed_xid {
            Some(sub) => {
                let top = self.stream_xid.ok_or_else(|| {
                    SyncError::decode("streamed change outside a stream block")
                })?;
                (top, sub, self.last_send_time)
            }
            None => {
                let open = self.open.ok_or_else(|| {
                    SyncError::decode(format!("{} outside a transaction", operation))
                })?;
                if open.skip {
                    return Ok(None);
                }
                (open.xid, open.xid, open.commit_timestamp)
            }
        };

        let info = self.relations.get(relation_id)?;
        let before_image = old.map(|o| self.relations.old_image(info, o)).transpose()?;
        let after_image = new.map(|n| self.relations.image(info, n)).transpose()?;

        Ok(Some(StreamItem::Change {
            event: ChangeEvent {
                transaction_id,
                lsn,
                table: info.table.clone(),
                key_columns: info.key_columns.clone(),
                operation,
                before_image,
                after_image,
                commit_timestamp,
                column_types: info.column_types.clone(),
            },
            origin_xid,
        }))
    }

    /// Give back the underlying connection.
    pub fn into_source(self) -> S {
        self.source
    }
}
