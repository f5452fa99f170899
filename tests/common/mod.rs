//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - pgoutput frame builders for a `public.users (id key, name)` table
//! - Coordinator and config helpers over a [`FrameLog`] source
//! - A target that holds batches until released, for backpressure tests
//! - PostgreSQL testcontainer setup

#![allow(dead_code)]

pub mod containers;

use bytes::{BufMut, Bytes, BytesMut};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use table_sync::retry::{ManualClock, RetryConfig};
use table_sync::stream::decoder::to_pg_timestamp;
use table_sync::target::{PreparedBatch, TargetDatabase, TargetFuture};
use table_sync::{FrameLog, Lsn, MemoryTarget, SyncConfig, SyncCoordinator};
use tokio::sync::watch;

pub const USERS: &str = "public.users";

// =============================================================================
// Frame builders
// =============================================================================

/// Builds replication frames with increasing WAL positions.
pub struct Frames {
    wal: u64,
}

impl Default for Frames {
    fn default() -> Self {
        Self::new()
    }
}

impl Frames {
    pub fn new() -> Self {
        Self { wal: 0x1000 }
    }

    fn wrap(&mut self, body: BytesMut) -> Bytes {
        self.wal += 0x10;
        let mut b = BytesMut::with_capacity(25 + body.len());
        b.put_u8(b'w');
        b.put_u64(self.wal);
        b.put_u64(self.wal);
        b.put_i64(to_pg_timestamp(chrono::Utc::now()));
        b.put_slice(&body);
        b.freeze()
    }

    fn tuple(b: &mut BytesMut, values: &[Option<&str>]) {
        b.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(v) => {
                    b.put_u8(b't');
                    b.put_u32(v.len() as u32);
                    b.put_slice(v.as_bytes());
                }
                None => b.put_u8(b'n'),
            }
        }
    }

    /// Relation 1: `public.users (id int4 key, name text)`.
    pub fn relation(&mut self) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'R');
        b.put_u32(1);
        b.put_slice(b"public\0users\0");
        b.put_u8(b'd');
        b.put_u16(2);
        b.put_u8(1);
        b.put_slice(b"id\0");
        b.put_u32(23);
        b.put_i32(-1);
        b.put_u8(0);
        b.put_slice(b"name\0");
        b.put_u32(25);
        b.put_i32(-1);
        self.wrap(b)
    }

    /// Relation 2: `public.documents (id int4 key, body jsonb)`.
    pub fn documents_relation(&mut self) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'R');
        b.put_u32(2);
        b.put_slice(b"public\0documents\0");
        b.put_u8(b'd');
        b.put_u16(2);
        b.put_u8(1);
        b.put_slice(b"id\0");
        b.put_u32(23);
        b.put_i32(-1);
        b.put_u8(0);
        b.put_slice(b"body\0");
        b.put_u32(3802);
        b.put_i32(-1);
        self.wrap(b)
    }

    pub fn insert_document(&mut self, id: &str, body: &str) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'I');
        b.put_u32(2);
        b.put_u8(b'N');
        Self::tuple(&mut b, &[Some(id), Some(body)]);
        self.wrap(b)
    }

    pub fn begin(&mut self, final_lsn: u64, xid: u32) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'B');
        b.put_u64(final_lsn);
        b.put_i64(to_pg_timestamp(chrono::Utc::now()));
        b.put_u32(xid);
        self.wrap(b)
    }

    pub fn commit(&mut self, commit_lsn: u64) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'C');
        b.put_u8(0);
        b.put_u64(commit_lsn);
        b.put_u64(commit_lsn + 8);
        b.put_i64(to_pg_timestamp(chrono::Utc::now()));
        self.wrap(b)
    }

    pub fn insert(&mut self, id: &str, name: &str) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'I');
        b.put_u32(1);
        b.put_u8(b'N');
        Self::tuple(&mut b, &[Some(id), Some(name)]);
        self.wrap(b)
    }

    pub fn update(&mut self, id: &str, name: &str) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'U');
        b.put_u32(1);
        b.put_u8(b'N');
        Self::tuple(&mut b, &[Some(id), Some(name)]);
        self.wrap(b)
    }

    pub fn delete(&mut self, id: &str) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'D');
        b.put_u32(1);
        b.put_u8(b'K');
        Self::tuple(&mut b, &[Some(id), None]);
        self.wrap(b)
    }

    /// `TRUNCATE` of relation 1.
    pub fn truncate(&mut self) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'T');
        b.put_u32(1);
        b.put_u8(0);
        b.put_u32(1);
        self.wrap(b)
    }

    pub fn keepalive(&mut self, reply_requested: bool) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'k');
        b.put_u64(self.wal);
        b.put_i64(to_pg_timestamp(chrono::Utc::now()));
        b.put_u8(reply_requested as u8);
        b.freeze()
    }

    pub fn stream_start(&mut self, xid: u32, first_segment: bool) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'S');
        b.put_u32(xid);
        b.put_u8(first_segment as u8);
        self.wrap(b)
    }

    pub fn stream_stop(&mut self) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'E');
        self.wrap(b)
    }

    /// Insert inside a stream block, attributed to (sub)transaction `xid`.
    pub fn stream_insert(&mut self, xid: u32, id: &str, name: &str) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'I');
        b.put_u32(xid);
        b.put_u32(1);
        b.put_u8(b'N');
        Self::tuple(&mut b, &[Some(id), Some(name)]);
        self.wrap(b)
    }

    pub fn stream_commit(&mut self, xid: u32, commit_lsn: u64) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'c');
        b.put_u32(xid);
        b.put_u8(0);
        b.put_u64(commit_lsn);
        b.put_u64(commit_lsn + 8);
        b.put_i64(to_pg_timestamp(chrono::Utc::now()));
        self.wrap(b)
    }

    pub fn stream_abort(&mut self, xid: u32, subxid: u32) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'A');
        b.put_u32(xid);
        b.put_u32(subxid);
        self.wrap(b)
    }

    /// `BEGIN`, one insert per row, `COMMIT`.
    pub fn transaction(&mut self, xid: u32, commit_lsn: u64, rows: &[(&str, &str)]) -> Vec<Bytes> {
        let mut frames = vec![self.begin(commit_lsn, xid)];
        for (id, name) in rows {
            frames.push(self.insert(id, name));
        }
        frames.push(self.commit(commit_lsn));
        frames
    }
}

/// Batch id the buffer assigns to a transaction.
pub fn batch_id(xid: u32, commit_lsn: u64) -> String {
    format!("{}@{}", xid, Lsn(commit_lsn))
}

// =============================================================================
// Coordinator helpers
// =============================================================================

/// Test config with the checkpoint store at `sqlite_path`.
pub fn config_at(set_name: &str, sqlite_path: &Path) -> SyncConfig {
    let mut config = SyncConfig::for_testing(set_name);
    config.checkpoint.sqlite_path = sqlite_path.to_string_lossy().to_string();
    config
}

/// Coordinator with instant backoff and fast-failing connect policies.
pub fn coordinator<T: TargetDatabase>(
    config: SyncConfig,
    log: &FrameLog,
    target: Arc<T>,
) -> (SyncCoordinator<FrameLog, T>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let coordinator = SyncCoordinator::new(config, Arc::new(log.clone()), target)
        .with_clock(clock.clone())
        .with_connect_policies(RetryConfig::testing(), RetryConfig::testing());
    (coordinator, clock)
}

/// Poll `condition` every 10ms until it holds, panicking after 10s.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if condition().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for the durable checkpoint to reach `lsn`.
pub async fn wait_for_checkpoint(rx: &mut watch::Receiver<Lsn>, lsn: u64) {
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|ack| *ack >= Lsn(lsn)))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for checkpoint {}", Lsn(lsn)))
        .expect("coordinator dropped");
}

// =============================================================================
// Gated target
// =============================================================================

/// Memory target whose applies block until [`open`](Self::open) is called.
pub struct GatedTarget {
    pub inner: MemoryTarget,
    gate: watch::Sender<bool>,
}

impl GatedTarget {
    pub fn closed() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: MemoryTarget::new(),
            gate,
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }
}

impl TargetDatabase for GatedTarget {
    fn apply_batch<'a>(&'a self, batch: &'a PreparedBatch) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
            self.inner.apply_batch(batch).await
        })
    }
}
