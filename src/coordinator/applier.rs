//! Applier task: committed batches to the target, then the checkpoint.
//!
//! Batches are applied strictly one at a time in commit order. After each
//! terminal outcome that advances (applied, retried-then-applied, or
//! dead-lettered and archived) the checkpoint is written durably and the
//! new LSN is published for the reader to acknowledge upstream.
//!
//! ```text
//! batch ──→ RetryController ──→ Applied/Retried ────────────┐
//!                  │                                        ├──→ checkpoint.write
//!                  ├──────────→ DeadLettered → archive ─────┘         │
//!                  ├──────────→ Fatal → coordinator Failed            ↓
//!                  └──────────→ Aborted (shutdown)              ack watch → reader
//! ```

use super::Shared;
use crate::apply::ApplyEngine;
use crate::batch::Batch;
use crate::checkpoint::{Checkpoint, CheckpointStore, DeadLetter};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::retry::{signalled, ApplyResult, ApplyStatus, Clock, RetryController};
use crate::target::TargetDatabase;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub(crate) struct ApplierContext<T: TargetDatabase> {
    pub engine: Arc<ApplyEngine<T>>,
    pub controller: RetryController<dyn Clock>,
    pub store: Arc<CheckpointStore>,
    pub batch_rx: mpsc::Receiver<Batch>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub shared: Arc<Shared>,
}

/// Run the applier until shutdown, a fatal error, or the buffer going away.
pub(crate) async fn run_applier<T: TargetDatabase>(mut ctx: ApplierContext<T>) {
    let span = info_span!("applier", set_name = %ctx.store.set_name());

    async move {
        info!("Starting batch applier");

        loop {
            let batch = tokio::select! {
                biased;
                _ = signalled(&mut ctx.shutdown_rx) => break,
                batch = ctx.batch_rx.recv() => match batch {
                    Some(batch) => batch,
                    None => {
                        debug!("Buffer gone, applier stopping");
                        break;
                    }
                },
            };

            let result = apply_one(&ctx, &batch).await;
            metrics::record_batch_outcome(&result.status.to_string(), batch.len());

            let advanced = match result.status {
                ApplyStatus::Applied | ApplyStatus::Retried => {
                    record_applied(&ctx.shared, &batch, result.status);
                    Ok(())
                }
                ApplyStatus::DeadLettered => dead_letter(&ctx, &batch, &result).await,
                ApplyStatus::Fatal => {
                    let cause = result.error.unwrap_or_else(|| {
                        SyncError::Internal(format!("batch {} failed without an error", batch.id))
                    });
                    ctx.shared.fail(&cause);
                    break;
                }
                ApplyStatus::Aborted => {
                    info!(batch_id = %batch.id, "Batch abandoned on shutdown, will replay");
                    break;
                }
            };

            let written = match advanced {
                Ok(()) => write_checkpoint(&ctx, &batch).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                ctx.shared.fail(&e);
                break;
            }
        }

        info!("Batch applier stopped");
    }
    .instrument(span)
    .await
}

async fn apply_one<T: TargetDatabase>(ctx: &ApplierContext<T>, batch: &Batch) -> ApplyResult {
    let span = info_span!(
        "batch",
        batch_id = %batch.id,
        commit_lsn = %batch.commit_lsn,
        events = batch.len()
    );
    let mut cancel = ctx.shutdown_rx.clone();
    let engine = &ctx.engine;

    ctx.controller
        .run(&batch.id, &mut cancel, || engine.apply_batch(batch))
        .instrument(span)
        .await
}

fn record_applied(shared: &Shared, batch: &Batch, status: ApplyStatus) {
    let stats = &shared.stats;
    stats.batches_applied.fetch_add(1, Ordering::Relaxed);
    if status == ApplyStatus::Retried {
        stats.batches_retried.fetch_add(1, Ordering::Relaxed);
    }
    stats
        .events_applied
        .fetch_add(batch.len() as u64, Ordering::Relaxed);

    if let Ok(lag) = (chrono::Utc::now() - batch.commit_timestamp).to_std() {
        metrics::record_replication_lag(lag);
    }
    debug!(batch_id = %batch.id, status = %status, "Batch applied");
}

async fn dead_letter<T: TargetDatabase>(
    ctx: &ApplierContext<T>,
    batch: &Batch,
    result: &ApplyResult,
) -> Result<()> {
    let detail = result
        .error_detail()
        .unwrap_or_else(|| "retries exhausted".to_string());
    let payload = serde_json::to_string(&batch.events).unwrap_or_default();
    error!(
        batch_id = %batch.id,
        attempts = result.attempts,
        error = %detail,
        events = %payload,
        "Batch dead-lettered"
    );

    ctx.store
        .record_dead_letter(&DeadLetter {
            batch_id: batch.id.clone(),
            transaction_id: batch.transaction_id,
            commit_lsn: batch.commit_lsn,
            attempts: result.attempts,
            error: detail,
            events: batch.events.clone(),
            dead_lettered_at: ctx.controller.clock().now(),
        })
        .await?;

    let stats = &ctx.shared.stats;
    stats.batches_dead_lettered.fetch_add(1, Ordering::Relaxed);
    stats.dead_letter_count.fetch_add(1, Ordering::Relaxed);
    warn!(batch_id = %batch.id, "Checkpoint advancing past dead-lettered batch");
    Ok(())
}

async fn write_checkpoint<T: TargetDatabase>(ctx: &ApplierContext<T>, batch: &Batch) -> Result<()> {
    let applied_at = ctx.controller.clock().now();
    ctx.store
        .write(Checkpoint {
            lsn: batch.commit_lsn,
            applied_at,
        })
        .await?;

    ctx.shared.record_checkpoint(batch.commit_lsn, applied_at);
    Ok(())
}
