//! Coordinator state and status types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    ↑                             │
//!    │                             │ (store open, lease held, source connected)
//!    │                             ↓
//!    │                          Running
//!    │                             │
//!    │                      stop() │      fatal error
//!    │                             ↓    (from Starting/Running)
//!    │                      ShuttingDown          │
//!    │                             │              ↓
//!    │                             ↓           Failed
//!    └─────── start() ──────── Stopped ←── stop() ┘
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `SyncCoordinator::new()`. Nothing opened.
//! - **Starting**: `start()` called; opening the checkpoint store, taking
//!   the lease, connecting the source.
//! - **Running**: Reader, buffer, applier and lease tasks are running.
//! - **ShuttingDown**: `stop()` called. The in-flight batch finishes or aborts.
//! - **Stopped**: Tasks joined, lease released, store closed. May be started again.
//! - **Failed**: A fatal error halted synchronization. The error is kept in
//!   [`StatusReport::last_error`]; `stop()` then `start()` to resume.

use crate::event::Lsn;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// State of the sync coordinator.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    /// Coordinator created but not started.
    Created,

    /// Opening storage, acquiring the lease, connecting the source.
    Starting,

    /// Streaming and applying.
    Running,

    /// Stopping: no new batches are taken; in-flight batch drains.
    ShuttingDown,

    /// Stopped cleanly. Safe to drop or restart.
    Stopped,

    /// Halted by a fatal error.
    ///
    /// Check `last_error` in the status report. Forward progress has stopped
    /// and the checkpoint is left at the last good batch.
    Failed,
}

impl CoordinatorState {
    /// Whether tasks may be running in this state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CoordinatorState::Starting | CoordinatorState::Running | CoordinatorState::ShuttingDown
        )
    }

    /// Whether `start()` is allowed from this state.
    pub fn can_start(self) -> bool {
        matches!(self, CoordinatorState::Created | CoordinatorState::Stopped)
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Created => write!(f, "Created"),
            CoordinatorState::Starting => write!(f, "Starting"),
            CoordinatorState::Running => write!(f, "Running"),
            CoordinatorState::ShuttingDown => write!(f, "ShuttingDown"),
            CoordinatorState::Stopped => write!(f, "Stopped"),
            CoordinatorState::Failed => write!(f, "Failed"),
        }
    }
}

/// Operator-facing snapshot of a coordinator.
///
/// Built from cached counters; producing one performs no I/O.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub set_name: String,
    pub state: CoordinatorState,
    /// Last durable checkpoint, `None` before the first batch.
    pub checkpoint_lsn: Option<Lsn>,
    pub last_applied_at: Option<DateTime<Utc>>,
    /// Batches applied, including those that needed retries.
    pub batches_applied: u64,
    /// Batches applied after at least one transient failure.
    pub batches_retried: u64,
    /// Dead letters on record for this set, including earlier runs.
    pub dead_letter_count: u64,
    pub events_applied: u64,
    pub reader_paused: bool,
    pub buffered_events: u64,
    /// Times the replication stream was re-established after a loss.
    pub reconnects: u64,
    pub last_error: Option<String>,
    /// Running with no recorded fatal error.
    pub healthy: bool,
}

/// Health check result, for readiness and liveness endpoints.
///
/// # Example
///
/// ```rust,ignore
/// let health = coordinator.health_check().await;
/// if health.ready {
///     HttpResponse::Ok()
/// } else {
///     HttpResponse::ServiceUnavailable()
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: CoordinatorState,
    /// Running: the coordinator is streaming.
    pub ready: bool,
    /// The target answered a ping.
    pub target_reachable: bool,
    pub reader_paused: bool,
    pub last_error: Option<String>,
    /// Ready, target reachable, and no fatal error.
    pub healthy: bool,
}
