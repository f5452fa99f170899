//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Change stream reading and reconnects
//! - Ordering buffer occupancy and backpressure
//! - Batch apply outcomes and latency
//! - Checkpoint writes and SQLite contention
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `table_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by this crate; the embedding process chooses one.
//!
//! # Usage
//!
//! ```rust,no_run
//! use table_sync::metrics;
//! use std::time::Duration;
//!
//! metrics::record_events_read(42);
//! metrics::record_apply_latency(Duration::from_millis(12), true);
//! ```

use crate::event::Lsn;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Reader
// =============================================================================

/// Record change events decoded from the stream.
pub fn record_events_read(count: usize) {
    counter!("table_sync_events_read_total").increment(count as u64);
}

/// Record TRUNCATE messages that were skipped.
pub fn record_truncate_skipped(tables: usize) {
    counter!("table_sync_truncate_skipped_tables_total").increment(tables as u64);
}

/// Record a source connect attempt.
pub fn record_source_connect(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("table_sync_source_connects_total", "status" => status).increment(1);
}

/// Record a reconnect after the replication stream was lost.
pub fn record_reconnect() {
    counter!("table_sync_reconnects_total").increment(1);
}

/// Gauge: 1 while the reader is paused by backpressure.
pub fn set_reader_paused(paused: bool) {
    gauge!("table_sync_reader_paused").set(if paused { 1.0 } else { 0.0 });
}

// =============================================================================
// Buffer
// =============================================================================

/// Gauge for events currently held by the ordering buffer.
pub fn set_buffered_events(count: usize) {
    gauge!("table_sync_buffered_events").set(count as f64);
}

/// Record the buffer exceeding capacity with nothing releasable.
pub fn record_buffer_overflow() {
    counter!("table_sync_buffer_overflows_total").increment(1);
}

/// Record commits dropped as replays after a reconnect.
pub fn record_replayed_commit(events_dropped: usize) {
    counter!("table_sync_replayed_commits_total").increment(1);
    counter!("table_sync_replayed_events_dropped_total").increment(events_dropped as u64);
}

// =============================================================================
// Apply
// =============================================================================

/// Record one apply attempt's latency and outcome.
pub fn record_apply_latency(duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    histogram!("table_sync_apply_duration_seconds", "status" => status)
        .record(duration.as_secs_f64());
}

/// Record a backoff before re-applying a batch.
pub fn record_apply_retry(delay: Duration) {
    counter!("table_sync_apply_retries_total").increment(1);
    histogram!("table_sync_apply_backoff_seconds").record(delay.as_secs_f64());
}

/// Record a batch's final status (`applied`, `retried`, `dead-lettered`,
/// `fatal`, `aborted`) and size.
pub fn record_batch_outcome(status: &str, events: usize) {
    counter!("table_sync_batches_total", "status" => status.to_string()).increment(1);
    histogram!("table_sync_batch_events").record(events as f64);
}

/// Record an event-to-target lag, commit timestamp to apply.
pub fn record_replication_lag(lag: Duration) {
    gauge!("table_sync_replication_lag_seconds").set(lag.as_secs_f64());
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Record a durable checkpoint write.
pub fn record_checkpoint_write(lsn: Lsn, duration: Duration) {
    counter!("table_sync_checkpoint_writes_total").increment(1);
    histogram!("table_sync_checkpoint_write_duration_seconds").record(duration.as_secs_f64());
    gauge!("table_sync_checkpoint_lsn").set(lsn.0 as f64);
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn checkpoint_retries_total(operation: &str) {
    counter!("table_sync_checkpoint_retries_total", "operation" => operation.to_string())
        .increment(1);
}

// =============================================================================
// Coordinator
// =============================================================================

/// Record errors by kind.
pub fn record_error(kind: &str) {
    counter!("table_sync_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Gauge for coordinator state.
pub fn set_coordinator_state(state: &str) {
    // Numeric encoding for alerting.
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("table_sync_coordinator_state").set(value);
}
