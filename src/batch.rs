//! Ordering buffer: per-transaction batches in commit order.
//!
//! Row changes may arrive interleaved across transactions (streamed
//! in-progress transactions do this). The buffer holds each transaction's
//! events until its commit marker arrives, then releases the whole
//! transaction as one [`Batch`].
//!
//! # Design
//!
//! ```text
//! StreamItem ──┬──▶ pending: HashMap<xid, events>   (uncommitted)
//!              │
//!   Commit ────┴──▶ released: VecDeque<Batch>       (commit order)
//!                              │
//!                              ▼
//!                       pop_released() → applier
//! ```
//!
//! # Ordering
//!
//! Commit markers arrive in source commit order, so releasing on commit is
//! enough to preserve it. The buffer additionally requires each released
//! commit LSN to be strictly greater than the last; a commit at or below it
//! is a replay after reconnect (the applier already has it) and is dropped
//! together with its events.
//!
//! # Capacity
//!
//! `buffered_events()` counts uncommitted events plus events in released
//! batches the applier has not taken yet. Above `max_buffered_events` the
//! reader should pause, but only when draining can make progress: if every
//! held event is uncommitted, only reading more (the commit markers) can
//! free space, so the buffer reports [`Pressure::Overflow`] and keeps
//! accepting.
use crate::error::{Result, SyncError};
use crate::event::{ChangeEvent, CommitMarker, Lsn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// Configuration for the ordering buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Events held before the reader is asked to pause.
    pub max_buffered_events: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffered_events: 10_000,
        }
    }
}

impl BufferConfig {
    /// Tiny buffer for testing backpressure.
    pub fn testing() -> Self {
        Self {
            max_buffered_events: 8,
        }
    }
}

/// One committed transaction, the unit of apply and checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// `"<xid>@<commit_lsn>"`.
    pub id: String,
    pub transaction_id: u32,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub commit_timestamp: DateTime<Utc>,
    /// Events in source order.
    pub events: Vec<ChangeEvent>,
}

impl Batch {
    pub fn id_for(transaction_id: u32, commit_lsn: Lsn) -> String {
        format!("{}@{}", transaction_id, commit_lsn)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What a commit marker did to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A batch was queued for the applier.
    Released { batch_id: String, events: usize },
    /// The transaction had no buffered events.
    Empty,
    /// Commit at or before the last released position; events dropped.
    Replay { dropped: usize },
}

/// Backpressure verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    /// Within capacity.
    Normal,
    /// Over capacity and the applier can drain: pause the reader.
    Pause,
    /// Over capacity but nothing is committed yet; pausing would stall.
    Overflow,
}

#[derive(Debug, Default)]
struct PendingTxn {
    /// `(origin_xid, event)`: the subtransaction each event came from.
    events: Vec<(u32, ChangeEvent)>,
}

/// Groups change events into per-transaction batches.
///
/// Single writer (the buffer task) and single reader (via
/// [`pop_released`](Self::pop_released)); released batches are handed
/// over by value and never touched again.
#[derive(Debug)]
pub struct OrderingBuffer {
    config: BufferConfig,
    pending: HashMap<u32, PendingTxn>,
    released: VecDeque<Batch>,
    uncommitted: usize,
    released_events: usize,
    last_released: Lsn,
}

impl OrderingBuffer {
    /// Create a buffer that treats commits at or below `resume_after` as
    /// already applied.
    pub fn new(config: BufferConfig, resume_after: Lsn) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            released: VecDeque::new(),
            uncommitted: 0,
            released_events: 0,
            last_released: resume_after,
        }
    }

    /// Buffer a change for its transaction.
    pub fn push(&mut self, event: ChangeEvent, origin_xid: u32) {
        trace!(xid = event.transaction_id, lsn = %event.lsn, "Buffered event");
        self.pending
            .entry(event.transaction_id)
            .or_default()
            .events
            .push((origin_xid, event));
        self.uncommitted += 1;
    }

    /// Apply a commit marker, releasing the transaction's batch.
    pub fn commit(&mut self, marker: CommitMarker) -> Result<CommitOutcome> {
        let txn = self.pending.remove(&marker.transaction_id).unwrap_or_default();
        let count = txn.events.len();
        self.uncommitted -= count;

        if marker.commit_lsn <= self.last_released {
            debug!(
                xid = marker.transaction_id,
                commit_lsn = %marker.commit_lsn,
                last_released = %self.last_released,
                dropped = count,
                "Dropping replayed transaction"
            );
            return Ok(CommitOutcome::Replay { dropped: count });
        }

        if count == 0 {
            trace!(xid = marker.transaction_id, "Empty transaction");
            return Ok(CommitOutcome::Empty);
        }

        let events: Vec<ChangeEvent> = txn
            .events
            .into_iter()
            .map(|(_, mut event)| {
                if event.transaction_id != marker.transaction_id {
                    return Err(SyncError::Internal(format!(
                        "event for xid {} filed under xid {}",
                        event.transaction_id, marker.transaction_id
                    )));
                }
                // Streamed changes only learn their commit time here.
                event.commit_timestamp = marker.commit_timestamp;
                Ok(event)
            })
            .collect::<Result<_>>()?;

        let batch = Batch {
            id: Batch::id_for(marker.transaction_id, marker.commit_lsn),
            transaction_id: marker.transaction_id,
            commit_lsn: marker.commit_lsn,
            end_lsn: marker.end_lsn,
            commit_timestamp: marker.commit_timestamp,
            events,
        };
        let outcome = CommitOutcome::Released {
            batch_id: batch.id.clone(),
            events: count,
        };
        debug!(batch_id = %batch.id, events = count, "Released batch");

        self.last_released = marker.commit_lsn;
        self.released_events += count;
        self.released.push_back(batch);
        Ok(outcome)
    }

    /// Roll back a streamed (sub)transaction.
    ///
    /// Returns the number of events dropped.
    pub fn abort(&mut self, transaction_id: u32, subtransaction_id: u32) -> usize {
        let dropped = if transaction_id == subtransaction_id {
            self.pending
                .remove(&transaction_id)
                .map(|t| t.events.len())
                .unwrap_or(0)
        } else {
            match self.pending.get_mut(&transaction_id) {
                Some(txn) => {
                    let before = txn.events.len();
                    txn.events.retain(|(origin, _)| *origin != subtransaction_id);
                    before - txn.events.len()
                }
                None => 0,
            }
        };
        self.uncommitted -= dropped;
        debug!(
            xid = transaction_id,
            subxid = subtransaction_id,
            dropped,
            "Aborted transaction"
        );
        dropped
    }

    /// Take the oldest released batch.
    pub fn pop_released(&mut self) -> Option<Batch> {
        let batch = self.released.pop_front()?;
        self.released_events -= batch.len();
        Some(batch)
    }

    pub fn has_released(&self) -> bool {
        !self.released.is_empty()
    }

    /// Drop all uncommitted state (the reader reconnected and will resend).
    ///
    /// Released batches are kept; their replays will be dropped on commit.
    pub fn discard_uncommitted(&mut self) -> usize {
        let dropped = self.uncommitted;
        self.pending.clear();
        self.uncommitted = 0;
        if dropped > 0 {
            debug!(dropped, "Discarded uncommitted events");
        }
        dropped
    }

    pub fn uncommitted_events(&self) -> usize {
        self.uncommitted
    }

    /// Uncommitted events plus events awaiting the applier.
    pub fn buffered_events(&self) -> usize {
        self.uncommitted + self.released_events
    }

    pub fn open_transactions(&self) -> usize {
        self.pending.len()
    }

    pub fn released_batches(&self) -> usize {
        self.released.len()
    }

    pub fn last_released_lsn(&self) -> Lsn {
        self.last_released
    }

    pub fn capacity(&self) -> usize {
        self.config.max_buffered_events
    }

    /// Current backpressure verdict.
    pub fn pressure(&self) -> Pressure {
        if self.buffered_events() <= self.config.max_buffered_events {
            Pressure::Normal
        } else if self.has_released() {
            Pressure::Pause
        } else {
            Pressure::Overflow
        }
    }

    /// Whether the reader should stop reading until the applier drains.
    pub fn should_pause(&self) -> bool {
        self.pressure() == Pressure::Pause
    }
}
