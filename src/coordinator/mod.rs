// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync coordinator.
//!
//! The orchestrator that ties together:
//! - The replication stream via [`crate::stream::StreamReader`]
//! - Transaction grouping via [`crate::batch::OrderingBuffer`]
//! - Batch apply via [`crate::apply::ApplyEngine`] and [`crate::retry::RetryController`]
//! - Durable progress via [`crate::checkpoint::CheckpointStore`]
//!
//! # Architecture
//!
//! ```text
//!  ┌────────┐  event queue   ┌────────┐  batch queue   ┌─────────┐
//!  │ reader │ ─────────────→ │ buffer │ ─────────────→ │ applier │ ──→ target
//!  └────────┘                └────────┘                └─────────┘
//!      ↑  ↑        pause          │                         │
//!      │  └───────────────────────┘                         │ checkpoint.write
//!      └──────────────────── ack LSN ───────────────────────┘
//! ```
//!
//! Plus a lease task renewing this instance's ownership of the table set.
//! All four tasks watch one shutdown flag. Any of them can halt the
//! coordinator with a fatal error; the others then wind down on their own.

mod applier;
mod buffer;
mod reader;
mod types;

pub use types::{CoordinatorState, HealthCheck, StatusReport};

use crate::apply::ApplyEngine;
use crate::batch::OrderingBuffer;
use crate::checkpoint::{CheckpointStore, DeadLetter};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::event::Lsn;
use crate::metrics;
use crate::retry::{signalled, Clock, RetryConfig, RetryController, TokioClock};
use crate::stream::SourceConnector;
use crate::target::TargetDatabase;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Timeout for the target ping in [`SyncCoordinator::health_check`].
const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters shared by the tasks, read by [`SyncCoordinator::status`].
#[derive(Debug, Default)]
pub(crate) struct SyncStats {
    pub batches_applied: AtomicU64,
    pub batches_retried: AtomicU64,
    pub batches_dead_lettered: AtomicU64,
    pub dead_letter_count: AtomicU64,
    pub events_applied: AtomicU64,
    pub buffered_events: AtomicU64,
    pub reader_paused: AtomicBool,
    pub reconnects: AtomicU64,
    pub checkpoint_lsn: AtomicU64,
    pub has_checkpoint: AtomicBool,
    pub last_applied_at: Mutex<Option<DateTime<Utc>>>,
}

/// State shared between the coordinator and its tasks.
pub(crate) struct Shared {
    set_name: String,
    state_tx: watch::Sender<CoordinatorState>,
    shutdown_tx: watch::Sender<bool>,
    /// Last durable checkpoint, acknowledged upstream by the reader.
    ack_tx: watch::Sender<Lsn>,
    last_error: Mutex<Option<String>>,
    pub stats: SyncStats,
}

impl Shared {
    fn new(set_name: &str) -> Self {
        let (state_tx, _) = watch::channel(CoordinatorState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let (ack_tx, _) = watch::channel(Lsn::ZERO);
        Self {
            set_name: set_name.to_string(),
            state_tx,
            shutdown_tx,
            ack_tx,
            last_error: Mutex::new(None),
            stats: SyncStats::default(),
        }
    }

    fn state(&self) -> CoordinatorState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state_tx.send_replace(state);
        metrics::set_coordinator_state(&state.to_string());
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Halt on a fatal error: record it, move to `Failed`, stop all tasks.
    pub(crate) fn fail(&self, cause: &SyncError) {
        error!(
            set_name = %self.set_name,
            kind = cause.kind(),
            error = %cause,
            "Synchronization halted"
        );
        metrics::record_error(cause.kind());
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(cause.to_string());
        }
        self.set_state(CoordinatorState::Failed);
        self.shutdown_tx.send_replace(true);
    }

    /// Publish a durable checkpoint.
    pub(crate) fn record_checkpoint(&self, lsn: Lsn, applied_at: DateTime<Utc>) {
        self.stats.checkpoint_lsn.store(lsn.0, Ordering::Relaxed);
        self.stats.has_checkpoint.store(true, Ordering::Relaxed);
        if let Ok(mut last) = self.stats.last_applied_at.lock() {
            *last = Some(applied_at);
        }
        self.ack_tx.send_replace(lsn);
    }
}

/// Keeps one target database in sync with a source's change stream.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use table_sync::{FrameLog, MemoryTarget, SyncConfig, SyncCoordinator};
///
/// # async fn run() -> table_sync::Result<()> {
/// let source = Arc::new(FrameLog::new());
/// let target = Arc::new(MemoryTarget::new());
/// let mut coordinator = SyncCoordinator::new(SyncConfig::for_testing("orders"), source, target);
///
/// coordinator.start().await?;
/// println!("{}", serde_json::to_string(&coordinator.status()).unwrap());
/// coordinator.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncCoordinator<C: SourceConnector, T: TargetDatabase> {
    config: SyncConfig,
    connector: Arc<C>,
    engine: Arc<ApplyEngine<T>>,
    clock: Arc<dyn Clock>,

    /// Connect policy inside `start()`.
    startup_policy: RetryConfig,
    /// Connect policy after the stream is lost.
    reconnect_policy: RetryConfig,

    shared: Arc<Shared>,
    state_rx: watch::Receiver<CoordinatorState>,

    /// Open while started.
    store: Option<Arc<CheckpointStore>>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl<C: SourceConnector, T: TargetDatabase> SyncCoordinator<C, T> {
    /// Create a coordinator. Nothing is opened until [`start`](Self::start).
    pub fn new(config: SyncConfig, connector: Arc<C>, target: Arc<T>) -> Self {
        let engine = Arc::new(ApplyEngine::new(target, &config.target));
        let shared = Arc::new(Shared::new(&config.set_name));
        let state_rx = shared.state_tx.subscribe();

        Self {
            config,
            connector,
            engine,
            clock: Arc::new(TokioClock),
            startup_policy: RetryConfig::startup(),
            reconnect_policy: RetryConfig::daemon(),
            shared,
            state_rx,
            store: None,
            handles: Vec::new(),
        }
    }

    /// Use a different clock for backoff waits and timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the source connect policies (startup and after a lost stream).
    pub fn with_connect_policies(mut self, startup: RetryConfig, reconnect: RetryConfig) -> Self {
        self.startup_policy = startup;
        self.reconnect_policy = reconnect;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn set_name(&self) -> &str {
        &self.config.set_name
    }

    pub fn target(&self) -> &Arc<T> {
        self.engine.target()
    }

    /// Get current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    /// Get a receiver for durable checkpoint LSNs.
    pub fn checkpoint_receiver(&self) -> watch::Receiver<Lsn> {
        self.shared.ack_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), CoordinatorState::Running)
    }

    /// Operator snapshot. Performs no I/O.
    pub fn status(&self) -> StatusReport {
        let stats = &self.shared.stats;
        let state = self.state();
        let last_error = self.shared.last_error();
        let checkpoint_lsn = stats
            .has_checkpoint
            .load(Ordering::Relaxed)
            .then(|| Lsn(stats.checkpoint_lsn.load(Ordering::Relaxed)));

        StatusReport {
            set_name: self.config.set_name.clone(),
            state,
            checkpoint_lsn,
            last_applied_at: stats.last_applied_at.lock().ok().and_then(|t| *t),
            batches_applied: stats.batches_applied.load(Ordering::Relaxed),
            batches_retried: stats.batches_retried.load(Ordering::Relaxed),
            dead_letter_count: stats.dead_letter_count.load(Ordering::Relaxed),
            events_applied: stats.events_applied.load(Ordering::Relaxed),
            reader_paused: stats.reader_paused.load(Ordering::Relaxed),
            buffered_events: stats.buffered_events.load(Ordering::Relaxed),
            reconnects: stats.reconnects.load(Ordering::Relaxed),
            healthy: state == CoordinatorState::Running && last_error.is_none(),
            last_error,
        }
    }

    /// Readiness and liveness, including a bounded target ping.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let last_error = self.shared.last_error();
        let target_reachable =
            match tokio::time::timeout(HEALTH_PING_TIMEOUT, self.engine.target().ping()).await {
                Ok(Ok(reachable)) => reachable,
                Ok(Err(e)) => {
                    debug!(error = %e, "Target ping failed");
                    false
                }
                Err(_) => false,
            };

        let ready = state == CoordinatorState::Running;
        HealthCheck {
            state,
            ready,
            target_reachable,
            reader_paused: self.shared.stats.reader_paused.load(Ordering::Relaxed),
            healthy: ready && target_reachable && last_error.is_none(),
            last_error,
        }
    }

    /// Dead-lettered batches for this set, oldest first.
    ///
    /// Works while stopped too: the configured store is opened briefly.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        if let Some(store) = &self.store {
            return store.dead_letters().await;
        }
        let store =
            CheckpointStore::open(&self.config.checkpoint.sqlite_path, &self.config.set_name)
                .await?;
        let letters = store.dead_letters().await;
        store.close().await;
        letters
    }

    /// Start synchronizing.
    ///
    /// 1. Opens the checkpoint store (SQLite)
    /// 2. Acquires the lease for the table set
    /// 3. Reads the checkpoint and connects the source there
    /// 4. Spawns the reader, buffer, applier and lease tasks
    ///
    /// Valid from `Created` or `Stopped`. On failure the coordinator is left
    /// `Failed` with the error in its status.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.state();
        if !state.can_start() {
            return Err(SyncError::InvalidState {
                expected: "Created or Stopped".to_string(),
                actual: state.to_string(),
            });
        }
        self.config.validate()?;

        info!(
            set_name = %self.config.set_name,
            source = %self.connector.endpoint(),
            "Starting sync coordinator"
        );

        if let Ok(mut last) = self.shared.last_error.lock() {
            *last = None;
        }
        self.shared.shutdown_tx.send_replace(false);
        self.shared.set_state(CoordinatorState::Starting);

        match self.launch().await {
            Ok(start_lsn) => {
                self.shared.set_state(CoordinatorState::Running);
                info!(
                    set_name = %self.config.set_name,
                    start = %start_lsn,
                    "Sync coordinator running"
                );
                Ok(())
            }
            Err(e) => {
                self.shared.fail(&e);
                self.join_tasks().await;
                self.close_store().await;
                Err(e)
            }
        }
    }

    async fn launch(&mut self) -> Result<Lsn> {
        let checkpoint_config = &self.config.checkpoint;
        let store = Arc::new(
            CheckpointStore::open(&checkpoint_config.sqlite_path, &self.config.set_name).await?,
        );
        self.store = Some(store.clone());

        store
            .acquire_lease(&checkpoint_config.holder_id, checkpoint_config.lease_ttl_duration())
            .await?;

        let start_lsn = match store.read().await? {
            Some(checkpoint) => {
                self.shared.record_checkpoint(checkpoint.lsn, checkpoint.applied_at);
                checkpoint.lsn
            }
            None => {
                self.shared.ack_tx.send_replace(Lsn::ZERO);
                Lsn::ZERO
            }
        };
        let dead_letters = store.dead_letter_count().await?;
        self.shared
            .stats
            .dead_letter_count
            .store(dead_letters as u64, Ordering::Relaxed);

        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        let source = reader::connect_with_retry(
            &*self.connector,
            start_lsn,
            &self.startup_policy,
            &*self.clock,
            &mut shutdown_rx,
        )
        .await?;

        let settings = &self.config.settings;
        let (item_tx, item_rx) = mpsc::channel(settings.reader.event_queue_capacity);
        let (batch_tx, batch_rx) = mpsc::channel(settings.buffer.batch_queue_capacity);
        let (pause_tx, pause_rx) = watch::channel(false);

        let reader_ctx = reader::ReaderContext {
            connector: self.connector.clone(),
            item_tx,
            pause_rx,
            ack_rx: self.shared.ack_tx.subscribe(),
            shutdown_rx: self.shared.shutdown_tx.subscribe(),
            keepalive_interval: settings.reader.keepalive_interval_duration(),
            reconnect_policy: self.reconnect_policy.clone(),
            clock: self.clock.clone(),
            shared: self.shared.clone(),
        };
        self.handles.push((
            "reader",
            tokio::spawn(reader::run_reader(reader_ctx, source, start_lsn)),
        ));

        let ordering = OrderingBuffer::new(settings.buffer.buffer_config(), start_lsn);
        let buffer_ctx = buffer::BufferContext {
            item_rx,
            batch_tx,
            pause_tx,
            shutdown_rx: self.shared.shutdown_tx.subscribe(),
            shared: self.shared.clone(),
        };
        self.handles.push((
            "buffer",
            tokio::spawn(buffer::run_buffer(ordering, buffer_ctx)),
        ));

        let applier_ctx = applier::ApplierContext {
            engine: self.engine.clone(),
            controller: RetryController::new(settings.apply.retry_config(), self.clock.clone()),
            store: store.clone(),
            batch_rx,
            shutdown_rx: self.shared.shutdown_tx.subscribe(),
            shared: self.shared.clone(),
        };
        self.handles.push((
            "applier",
            tokio::spawn(applier::run_applier(applier_ctx)),
        ));

        self.spawn_lease_task(store);
        Ok(start_lsn)
    }

    /// Renew the lease every third of its TTL. Losing it halts the coordinator.
    fn spawn_lease_task(&mut self, store: Arc<CheckpointStore>) {
        let holder = self.config.checkpoint.holder_id.clone();
        let ttl = self.config.checkpoint.lease_ttl_duration();
        let every = self.config.checkpoint.lease_renew_interval();
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        let shared = self.shared.clone();
        let span = info_span!("lease", holder = %holder);

        let handle = tokio::spawn(
            async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                loop {
                    tokio::select! {
                        biased;
                        _ = signalled(&mut shutdown_rx) => break,
                        _ = ticker.tick() => {
                            if let Err(e) = store.renew_lease(&holder, ttl).await {
                                shared.fail(&e);
                                break;
                            }
                            trace!("Lease renewed");
                        }
                    }
                }
                debug!("Lease task stopped");
            }
            .instrument(span),
        );

        self.handles.push(("lease", handle));
    }

    /// Stop gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal all tasks to stop
    /// 2. Wait for the applier to finish or abort its batch (with timeout)
    /// 3. Release the lease and close the checkpoint store
    ///
    /// From `Failed`, the error stays in the status until the next start.
    pub async fn stop(&mut self) {
        let state = self.state();
        info!(set_name = %self.config.set_name, state = %state, "Stopping sync coordinator");
        if state.is_active() {
            self.shared.set_state(CoordinatorState::ShuttingDown);
        }

        self.shared.shutdown_tx.send_replace(true);
        self.join_tasks().await;
        self.close_store().await;

        self.shared.stats.reader_paused.store(false, Ordering::Relaxed);
        self.shared.set_state(CoordinatorState::Stopped);
        info!(set_name = %self.config.set_name, "Sync coordinator stopped");
    }

    async fn join_tasks(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        if !handles.is_empty() {
            info!(task_count = handles.len(), "Waiting for tasks to drain and complete");
        }

        let drain_timeout = self.config.settings.shutdown.drain_timeout_duration();
        for (task, mut handle) in handles {
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task, "Task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }
    }

    async fn close_store(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(e) = store.release_lease(&self.config.checkpoint.holder_id).await {
                warn!(error = %e, "Failed to release lease");
            }
            store.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ManualClock;
    use crate::stream::FrameLog;
    use crate::target::MemoryTarget;

    fn coordinator(set_name: &str) -> SyncCoordinator<FrameLog, MemoryTarget> {
        SyncCoordinator::new(
            SyncConfig::for_testing(set_name),
            Arc::new(FrameLog::new()),
            Arc::new(MemoryTarget::new()),
        )
        .with_clock(Arc::new(ManualClock::new()))
        .with_connect_policies(RetryConfig::testing(), RetryConfig::testing())
    }

    #[test]
    fn test_coordinator_initial_state() {
        let coordinator = coordinator("orders");
        assert_eq!(coordinator.state(), CoordinatorState::Created);
        assert!(!coordinator.is_running());
        assert_eq!(coordinator.set_name(), "orders");
    }

    #[test]
    fn test_status_before_start() {
        let status = coordinator("orders").status();
        assert_eq!(status.state, CoordinatorState::Created);
        assert_eq!(status.checkpoint_lsn, None);
        assert_eq!(status.batches_applied, 0);
        assert!(!status.healthy);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_start_invalid_state() {
        let mut coordinator = coordinator("orders");
        coordinator.shared.set_state(CoordinatorState::Running);

        match coordinator.start().await {
            Err(SyncError::InvalidState { expected, actual }) => {
                assert_eq!(expected, "Created or Stopped");
                assert_eq!(actual, "Running");
            }
            other => panic!("Expected InvalidState error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_stop_from_created() {
        let mut coordinator = coordinator("orders");
        coordinator.stop().await;
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let mut coordinator = coordinator("orders");
        coordinator.start().await.unwrap();
        assert!(coordinator.is_running());
        assert!(coordinator.status().healthy);

        let health = coordinator.health_check().await;
        assert!(health.ready);
        assert!(health.target_reachable);

        coordinator.stop().await;
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
        assert!(coordinator.handles.is_empty());
        assert!(coordinator.store.is_none());
    }

    #[tokio::test]
    async fn test_start_fails_when_source_unreachable() {
        let log = FrameLog::new();
        log.refuse_connects(usize::MAX);
        let mut coordinator = SyncCoordinator::new(
            SyncConfig::for_testing("orders"),
            Arc::new(log),
            Arc::new(MemoryTarget::new()),
        )
        .with_clock(Arc::new(ManualClock::new()))
        .with_connect_policies(RetryConfig::testing(), RetryConfig::testing());

        let err = coordinator.start().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(coordinator.state(), CoordinatorState::Failed);
        assert!(coordinator.status().last_error.is_some());
        assert!(coordinator.store.is_none());

        coordinator.stop().await;
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
        assert!(coordinator.status().last_error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_opening_anything() {
        let mut coordinator = coordinator("");
        let err = coordinator.start().await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert_eq!(coordinator.state(), CoordinatorState::Created);
    }
}
