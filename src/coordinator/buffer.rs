//! Buffer task: groups stream items into committed batches.
//!
//! Sits between the reader and the applier and owns the [`OrderingBuffer`].
//! Released batches go to the applier over a bounded queue; when the buffer
//! is over capacity with releasable work it raises the pause flag the
//! reader watches.

use super::reader::ReaderMessage;
use super::Shared;
use crate::batch::{Batch, CommitOutcome, OrderingBuffer, Pressure};
use crate::metrics;
use crate::retry::signalled;
use crate::stream::StreamItem;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

pub(crate) struct BufferContext {
    pub item_rx: mpsc::Receiver<ReaderMessage>,
    pub batch_tx: mpsc::Sender<Batch>,
    pub pause_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub shared: Arc<Shared>,
}

/// Run the buffer until shutdown, a fatal error, or the reader going away.
pub(crate) async fn run_buffer(mut buffer: OrderingBuffer, mut ctx: BufferContext) {
    let span = info_span!("buffer", capacity = buffer.capacity());

    async move {
        info!(resume_after = %buffer.last_released_lsn(), "Starting ordering buffer");
        let mut overflowing = false;

        loop {
            let has_released = buffer.has_released();
            tokio::select! {
                biased;

                _ = signalled(&mut ctx.shutdown_rx) => break,

                permit = ctx.batch_tx.reserve(), if has_released => {
                    let Ok(permit) = permit else {
                        debug!("Applier gone, buffer stopping");
                        break;
                    };
                    if let Some(batch) = buffer.pop_released() {
                        permit.send(batch);
                    }
                }

                msg = ctx.item_rx.recv() => match msg {
                    Some(ReaderMessage::Item(item)) => {
                        if let Err(e) = handle_item(&mut buffer, item) {
                            ctx.shared.fail(&e);
                            break;
                        }
                    }
                    Some(ReaderMessage::Reset) => {
                        let dropped = buffer.discard_uncommitted();
                        if dropped > 0 {
                            info!(dropped, "Discarded partial transactions after reconnect");
                        }
                    }
                    None => {
                        debug!("Reader gone, buffer stopping");
                        break;
                    }
                },
            }

            let pressure = buffer.pressure();
            let paused = pressure == Pressure::Pause;
            ctx.pause_tx.send_if_modified(|current| {
                if *current != paused {
                    *current = paused;
                    true
                } else {
                    false
                }
            });

            match (pressure, overflowing) {
                (Pressure::Overflow, false) => {
                    overflowing = true;
                    metrics::record_buffer_overflow();
                    warn!(
                        buffered = buffer.buffered_events(),
                        capacity = buffer.capacity(),
                        open_transactions = buffer.open_transactions(),
                        "Buffer over capacity with no committed work, admitting events"
                    );
                }
                (Pressure::Overflow, true) => {}
                (_, _) => overflowing = false,
            }

            let buffered = buffer.buffered_events();
            metrics::set_buffered_events(buffered);
            ctx.shared
                .stats
                .buffered_events
                .store(buffered as u64, Ordering::Relaxed);
            ctx.shared.stats.reader_paused.store(paused, Ordering::Relaxed);
        }

        ctx.pause_tx.send_replace(false);
        ctx.shared.stats.reader_paused.store(false, Ordering::Relaxed);
        info!(
            released = buffer.released_batches(),
            pending = buffer.buffered_events(),
            "Ordering buffer stopped"
        );
    }
    .instrument(span)
    .await
}

fn handle_item(buffer: &mut OrderingBuffer, item: StreamItem) -> crate::error::Result<()> {
    match item {
        StreamItem::Change { event, origin_xid } => buffer.push(event, origin_xid),
        StreamItem::Commit(marker) => {
            if let CommitOutcome::Replay { dropped } = buffer.commit(marker)? {
                metrics::record_replayed_commit(dropped);
            }
        }
        StreamItem::Abort {
            transaction_id,
            subtransaction_id,
        } => {
            buffer.abort(transaction_id, subtransaction_id);
        }
    }
    Ok(())
}
