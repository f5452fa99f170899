//! # Table Sync
//!
//! Keeps a target database consistent with a PostgreSQL source by consuming
//! its logical replication stream (`pgoutput`).
//!
//! ## Architecture
//!
//! Three tasks connected by bounded queues, plus a lease renewer:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              table-sync                                 │
//! │                                                                         │
//! │  ┌──────────────┐    ┌────────────────┐    ┌──────────────────────────┐ │
//! │  │ StreamReader │───►│ OrderingBuffer │───►│ RetryController          │ │
//! │  │ (pgoutput)   │    │ (per xid)      │    │  → ApplyEngine → target  │ │
//! │  └──────────────┘    └────────────────┘    └──────────────────────────┘ │
//! │         ▲                                              │                │
//! │         │ ack LSN                                      ▼                │
//! │         │                                   ┌─────────────────────────┐ │
//! │         └───────────────────────────────────│ CheckpointStore (SQLite)│ │
//! │                                             │ checkpoint, lease, DLQ  │ │
//! │                                             └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Transactional**: each source transaction is applied to the target as
//!    one atomic batch, in commit order
//! 2. **Resumable**: progress is a durable checkpoint LSN; after a crash the
//!    stream resumes there and replayed batches are idempotent upserts
//! 3. **Bounded**: a full buffer pauses the reader instead of growing
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use table_sync::{FrameLog, MemoryTarget, SyncConfig, SyncCoordinator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::for_testing("orders");
//!     let source = Arc::new(FrameLog::new());
//!     let target = Arc::new(MemoryTarget::new());
//!
//!     let mut coordinator = SyncCoordinator::new(config, source, target);
//!     coordinator.start().await.expect("Failed to start");
//!
//!     // Runs until stopped
//!     coordinator.stop().await;
//! }
//! ```

pub mod apply;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod metrics;
pub mod retry;
pub mod stream;
pub mod target;

// Re-exports for convenience
pub use apply::ApplyEngine;
pub use batch::{Batch, BufferConfig, OrderingBuffer};
pub use checkpoint::{Checkpoint, CheckpointStore, DeadLetter};
pub use config::{CheckpointConfig, SourceConfig, SyncConfig, SyncSettings, TargetConfig};
pub use coordinator::{CoordinatorState, HealthCheck, StatusReport, SyncCoordinator};
pub use error::{Result, SyncError};
pub use event::{ChangeEvent, ColumnValue, Lsn, Operation, TableId};
pub use retry::{ApplyResult, ApplyStatus, Clock, ManualClock, RetryConfig, TokioClock};
pub use stream::{FrameLog, ReplicationSource, SourceConnector, StreamItem, StreamReader};
pub use target::{MemoryTarget, PostgresTarget, TargetDatabase, TargetError};
