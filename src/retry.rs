//! Conflict/retry controller: per-batch state machine with backoff.
//!
//! Every batch moves through an explicit state machine:
//!
//! ```text
//!            Start              Succeeded
//! Pending ─────────▶ Applying ─────────────▶ Applied
//!    │                 │  ▲
//!    │   Transient     │  │ BackoffElapsed
//!    │   (attempts     ▼  │
//!    │    left)     Retrying ──Cancelled──▶ Aborted
//!    │                 │
//!    │    Transient (ceiling reached) ──▶ DeadLettered
//!    │    Fatal (constraint, decode) ───▶ Fatal
//!    └──Cancelled──▶ Aborted
//! ```
//!
//! Only errors for which [`SyncError::is_retryable()`] holds are retried.
//! A `Connection` failure always takes the `Retrying` edge: an unreachable
//! target holds the batch instead of spending its attempt budget.
//! Backoff delays go through a [`Clock`], so tests drive the machine with
//! [`ManualClock`] and never sleep for real.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use table_sync::retry::{RetryConfig, RetryController, TokioClock};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! let controller = RetryController::new(RetryConfig::default(), Arc::new(TokioClock));
//! let (_tx, mut cancel) = watch::channel(false);
//! let result = controller.run("42@0/16B3", &mut cancel, || async { Ok(()) }).await;
//! assert!(result.status.is_success());
//! # }
//! ```

use crate::error::{Result, SyncError};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::fmt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, warn};

// =============================================================================
// Backoff policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (the first try counts).
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    pub max_attempts: usize,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for the initial source connection.
    ///
    /// Attempts connection 20 times with exponential backoff, failing after
    /// roughly 45 seconds in total, so configuration errors surface quickly.
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Infinite retry for reconnecting a running coordinator.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9+       300s (cap), forever
    /// ```
    ///
    /// The replication slot keeps WAL on the source while we are away, so
    /// giving up buys nothing.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay after a given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn allows_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Source of time for backoff delays and timestamps.
pub trait Clock: Send + Sync + 'static {
    /// Wait for `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()>;

    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Real time via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock: sleeps return immediately and advance a virtual time.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Every delay requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Sum of requested delays.
    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        }
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|n| *n)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

// =============================================================================
// State machine
// =============================================================================

/// State of one batch in the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Applying,
    Retrying,
    Applied,
    DeadLettered,
    Fatal,
    Aborted,
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    Start,
    Succeeded,
    TransientFailure { attempts_exhausted: bool },
    FatalFailure,
    BackoffElapsed,
    Cancelled,
}

impl BatchState {
    /// Transition table. Anything not listed is an invalid transition.
    pub fn on(self, event: BatchEvent) -> Result<BatchState> {
        use BatchEvent::*;
        use BatchState::*;

        match (self, event) {
            (Pending, Start) => Ok(Applying),
            (Pending, Cancelled) => Ok(Aborted),
            (Applying, Succeeded) => Ok(Applied),
            (Applying, TransientFailure { attempts_exhausted: false }) => Ok(Retrying),
            (Applying, TransientFailure { attempts_exhausted: true }) => Ok(DeadLettered),
            (Applying, FatalFailure) => Ok(Fatal),
            (Retrying, BackoffElapsed) => Ok(Applying),
            (Retrying, Cancelled) => Ok(Aborted),
            (from, event) => Err(SyncError::InvalidState {
                expected: format!("a state accepting {:?}", event),
                actual: from.to_string(),
            }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::Applied | BatchState::DeadLettered | BatchState::Fatal | BatchState::Aborted
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Pending => write!(f, "pending"),
            BatchState::Applying => write!(f, "applying"),
            BatchState::Retrying => write!(f, "retrying"),
            BatchState::Applied => write!(f, "applied"),
            BatchState::DeadLettered => write!(f, "dead-lettered"),
            BatchState::Fatal => write!(f, "fatal"),
            BatchState::Aborted => write!(f, "aborted"),
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// Final status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    /// Applied on the first attempt.
    Applied,
    /// Applied after at least one transient failure.
    Retried,
    /// Retries exhausted; set aside.
    DeadLettered,
    /// Non-retryable failure; synchronization must stop.
    Fatal,
    /// Stop requested while waiting to retry; nothing applied.
    Aborted,
}

impl ApplyStatus {
    /// The batch is on the target.
    pub fn is_success(self) -> bool {
        matches!(self, ApplyStatus::Applied | ApplyStatus::Retried)
    }

    /// The checkpoint may move past this batch.
    pub fn advances_checkpoint(self) -> bool {
        matches!(
            self,
            ApplyStatus::Applied | ApplyStatus::Retried | ApplyStatus::DeadLettered
        )
    }
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyStatus::Applied => write!(f, "applied"),
            ApplyStatus::Retried => write!(f, "retried"),
            ApplyStatus::DeadLettered => write!(f, "dead-lettered"),
            ApplyStatus::Fatal => write!(f, "fatal"),
            ApplyStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Outcome of running one batch through the controller.
#[derive(Debug)]
pub struct ApplyResult {
    pub batch_id: String,
    pub status: ApplyStatus,
    /// Apply attempts made.
    pub attempts: usize,
    /// Last error, for every status except `Applied`.
    pub error: Option<SyncError>,
}

impl ApplyResult {
    pub fn error_detail(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Drives batches through the state machine.
pub struct RetryController<C: Clock + ?Sized = TokioClock> {
    policy: RetryConfig,
    clock: Arc<C>,
}

impl<C: Clock + ?Sized> RetryController<C> {
    pub fn new(policy: RetryConfig, clock: Arc<C>) -> Self {
        Self { policy, clock }
    }

    pub fn policy(&self) -> &RetryConfig {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<C> {
        &self.clock
    }

    /// Run `attempt` until it succeeds, fails fatally, exhausts the attempt
    /// ceiling, or `cancel` turns true during a backoff wait.
    ///
    /// Only transient failures count toward the ceiling. A `Connection`
    /// failure means the target is unreachable, not that the batch is bad,
    /// so it is retried with capped backoff until the target comes back or
    /// `cancel` fires. It never dead-letters the batch.
    ///
    /// Cancellation is never observed while an attempt is in flight: the
    /// target either commits or rolls back the whole batch first.
    pub async fn run<F, Fut>(
        &self,
        batch_id: &str,
        cancel: &mut watch::Receiver<bool>,
        mut attempt: F,
    ) -> ApplyResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut state = BatchState::Pending;
        let mut attempts = 0usize;
        let mut transient_failures = 0usize;
        let mut outage_failures = 0usize;
        let mut delay = Duration::ZERO;
        let mut last_error: Option<SyncError> = None;

        let step = |state: BatchState, event: BatchEvent, last_error: &mut Option<SyncError>| {
            match state.on(event) {
                Ok(next) => next,
                Err(e) => {
                    *last_error = Some(e);
                    BatchState::Fatal
                }
            }
        };

        state = step(state, BatchEvent::Start, &mut last_error);

        while !state.is_terminal() {
            state = match state {
                BatchState::Applying => {
                    attempts += 1;
                    match attempt().await {
                        Ok(()) => step(state, BatchEvent::Succeeded, &mut last_error),
                        Err(e @ SyncError::Connection { .. }) => {
                            outage_failures += 1;
                            delay = self.policy.delay_for_attempt(outage_failures);
                            warn!(
                                batch_id,
                                attempt = attempts,
                                error = %e,
                                "Target unreachable, holding batch until it returns"
                            );
                            last_error = Some(e);
                            step(
                                state,
                                BatchEvent::TransientFailure {
                                    attempts_exhausted: false,
                                },
                                &mut last_error,
                            )
                        }
                        Err(e) if e.is_retryable() => {
                            transient_failures += 1;
                            delay = self.policy.delay_for_attempt(transient_failures);
                            let exhausted = !self.policy.allows_retry(transient_failures);
                            warn!(
                                batch_id,
                                attempt = attempts,
                                max_attempts = self.policy.max_attempts,
                                error = %e,
                                "Batch apply failed, transient"
                            );
                            last_error = Some(e);
                            step(
                                state,
                                BatchEvent::TransientFailure {
                                    attempts_exhausted: exhausted,
                                },
                                &mut last_error,
                            )
                        }
                        Err(e) => {
                            error!(batch_id, error = %e, "Batch apply failed, fatal");
                            last_error = Some(e);
                            step(state, BatchEvent::FatalFailure, &mut last_error)
                        }
                    }
                }
                BatchState::Retrying => {
                    metrics::record_apply_retry(delay);
                    tokio::select! {
                        biased;
                        _ = signalled(cancel) => step(state, BatchEvent::Cancelled, &mut last_error),
                        _ = self.clock.sleep(delay) => step(state, BatchEvent::BackoffElapsed, &mut last_error),
                    }
                }
                other => step(other, BatchEvent::Start, &mut last_error),
            };
        }

        let status = match state {
            BatchState::Applied if attempts > 1 => ApplyStatus::Retried,
            BatchState::Applied => ApplyStatus::Applied,
            BatchState::DeadLettered => ApplyStatus::DeadLettered,
            BatchState::Aborted => ApplyStatus::Aborted,
            _ => ApplyStatus::Fatal,
        };
        if status == ApplyStatus::Applied {
            last_error = None;
        }

        ApplyResult {
            batch_id: batch_id.to_string(),
            status,
            attempts,
            error: last_error,
        }
    }
}

/// Resolves once the flag is true. Never resolves if the sender is gone.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
