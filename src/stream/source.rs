//! Replication source abstraction.
//!
//! The replication connection itself (START_REPLICATION over the streaming
//! protocol) lives outside this crate. It is consumed here as an opaque
//! sequence of CopyData payloads, plus a way to send standby status updates
//! back so the server can advance the slot.
//!
//! [`FrameLog`] is an in-process source: an append-only log of frames that
//! any number of connections can replay. It backs tests and dry runs.

use crate::error::{Result, SyncError};
use crate::event::Lsn;
use crate::stream::decoder::to_pg_timestamp;
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Boxed future returned by source operations.
pub type SourceFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Standby status update sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatus {
    /// Last WAL position received.
    pub received: Lsn,
    /// Last position durably checkpointed on our side.
    pub flushed: Lsn,
    /// Last position applied to the target.
    pub applied: Lsn,
    pub reply_requested: bool,
}

impl StandbyStatus {
    /// Encode as an `'r'` CopyData payload.
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(34);
        b.put_u8(b'r');
        b.put_u64(self.received.0);
        b.put_u64(self.flushed.0);
        b.put_u64(self.applied.0);
        b.put_i64(to_pg_timestamp(chrono::Utc::now()));
        b.put_u8(self.reply_requested as u8);
        b.freeze()
    }
}

/// An open replication connection.
///
/// Owned by exactly one reader task for the connection's lifetime.
pub trait ReplicationSource: Send + 'static {
    /// Next CopyData payload. `Ok(None)` means the server ended the stream.
    fn next_frame(&mut self) -> SourceFuture<'_, Option<Bytes>>;

    /// Send a standby status update.
    fn send_status(&mut self, status: StandbyStatus) -> SourceFuture<'_, ()>;
}

/// Opens replication connections.
pub trait SourceConnector: Send + Sync + 'static {
    type Source: ReplicationSource;

    /// Start streaming at `start`. The server may resend transactions that
    /// commit at or before `start`; the reader filters those.
    fn connect(&self, start: Lsn) -> SourceFuture<'_, Self::Source>;

    /// Human-readable endpoint, for logs and errors.
    fn endpoint(&self) -> String {
        "source".to_string()
    }
}

// =============================================================================
// In-process frame log
// =============================================================================

#[derive(Default)]
struct FrameLogInner {
    frames: Mutex<Vec<Bytes>>,
    notify: Notify,
    statuses: Mutex<Vec<StandbyStatus>>,
    connects: AtomicUsize,
    refuse_connects: AtomicUsize,
    /// Bumped by `disconnect`; sources from older generations end.
    generation: AtomicUsize,
    closed: AtomicBool,
}

/// Append-only log of frames, replayable by any number of connections.
#[derive(Clone, Default)]
pub struct FrameLog {
    inner: Arc<FrameLogInner>,
}

impl FrameLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame and wake waiting readers.
    pub fn append(&self, frame: Bytes) {
        if let Ok(mut frames) = self.inner.frames.lock() {
            frames.push(frame);
        }
        self.inner.notify.notify_waiters();
    }

    pub fn extend(&self, frames: impl IntoIterator<Item = Bytes>) {
        if let Ok(mut log) = self.inner.frames.lock() {
            log.extend(frames);
        }
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status updates sent by all connections so far.
    pub fn statuses(&self) -> Vec<StandbyStatus> {
        self.inner
            .statuses
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` connection attempts with a connection error.
    pub fn refuse_connects(&self, n: usize) {
        self.inner.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// End the stream for current readers once they drain the log.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Re-open after [`close`](Self::close).
    pub fn reopen(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    /// End every open connection now, as a dropped network link would.
    /// New connections are unaffected.
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    fn generation(&self) -> usize {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn frame_at(&self, pos: usize) -> Option<Bytes> {
        self.inner
            .frames
            .lock()
            .ok()
            .and_then(|f| f.get(pos).cloned())
    }
}

/// One connection replaying a [`FrameLog`] from the beginning.
pub struct FrameLogSource {
    log: FrameLog,
    pos: usize,
    generation: usize,
}

impl ReplicationSource for FrameLogSource {
    fn next_frame(&mut self) -> SourceFuture<'_, Option<Bytes>> {
        Box::pin(async move {
            loop {
                let notified = self.log.inner.notify.notified();
                if self.log.generation() != self.generation {
                    return Err(SyncError::connection("frame-log", "connection reset"));
                }
                if let Some(frame) = self.log.frame_at(self.pos) {
                    self.pos += 1;
                    return Ok(Some(frame));
                }
                if self.log.inner.closed.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                notified.await;
            }
        })
    }

    fn send_status(&mut self, status: StandbyStatus) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            self.log
                .inner
                .statuses
                .lock()
                .map_err(|_| SyncError::Internal("status log poisoned".to_string()))?
                .push(status);
            Ok(())
        })
    }
}

impl SourceConnector for FrameLog {
    type Source = FrameLogSource;

    fn connect(&self, _start: Lsn) -> SourceFuture<'_, FrameLogSource> {
        Box::pin(async move {
            let refused = self
                .inner
                .refuse_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(SyncError::connection(self.endpoint(), "connection refused"));
            }
            self.inner.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FrameLogSource {
                log: self.clone(),
                pos: 0,
                generation: self.generation(),
            })
        })
    }

    fn endpoint(&self) -> String {
        "frame-log".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_frame_log_replays_from_start() {
        let log = FrameLog::new();
        log.append(Bytes::from_static(b"a"));
        log.append(Bytes::from_static(b"b"));

        let mut first = log.connect(Lsn::ZERO).await.unwrap();
        assert_eq!(first.next_frame().await.unwrap().unwrap(), "a");

        let mut second = log.connect(Lsn::ZERO).await.unwrap();
        assert_eq!(second.next_frame().await.unwrap().unwrap(), "a");
        assert_eq!(second.next_frame().await.unwrap().unwrap(), "b");
        assert_eq!(log.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_frame_log_waits_for_append() {
        let log = FrameLog::new();
        let mut src = log.connect(Lsn::ZERO).await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(Bytes::from_static(b"late"));
        });

        let frame = tokio::time::timeout(Duration::from_secs(2), src.next_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.unwrap(), "late");
    }

    #[tokio::test]
    async fn test_frame_log_close_ends_stream() {
        let log = FrameLog::new();
        log.close();
        let mut src = log.connect(Lsn::ZERO).await.unwrap();
        assert!(src.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_resets_open_connections_only() {
        let log = FrameLog::new();
        log.append(Bytes::from_static(b"a"));
        let mut old = log.connect(Lsn::ZERO).await.unwrap();
        log.disconnect();

        let err = old.next_frame().await.unwrap_err();
        assert!(err.is_retryable());

        let mut fresh = log.connect(Lsn::ZERO).await.unwrap();
        assert_eq!(fresh.next_frame().await.unwrap().unwrap(), "a");
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let log = FrameLog::new();
        log.refuse_connects(2);
        assert!(log.connect(Lsn::ZERO).await.is_err());
        assert!(log.connect(Lsn::ZERO).await.is_err());
        assert!(log.connect(Lsn::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_recorded() {
        let log = FrameLog::new();
        let mut src = log.connect(Lsn::ZERO).await.unwrap();
        let status = StandbyStatus {
            received: Lsn(10),
            flushed: Lsn(5),
            applied: Lsn(5),
            reply_requested: false,
        };
        src.send_status(status).await.unwrap();
        assert_eq!(log.statuses(), vec![status]);
    }

    #[test]
    fn test_standby_status_encoding() {
        let status = StandbyStatus {
            received: Lsn(1),
            flushed: Lsn(2),
            applied: Lsn(3),
            reply_requested: true,
        };
        let b = status.encode();
        assert_eq!(b.len(), 34);
        assert_eq!(b[0], b'r');
        assert_eq!(&b[1..9], &1u64.to_be_bytes());
        assert_eq!(&b[9..17], &2u64.to_be_bytes());
        assert_eq!(b[33], 1);
    }
}
