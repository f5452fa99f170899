//! Reader task: replication stream to the ordering buffer.
//!
//! Owns the replication connection for its whole lifetime:
//! 1. Decodes frames into stream items and forwards them over a bounded queue
//! 2. Reports the applier's checkpoint back to the server as the flushed LSN
//! 3. Stops reading while the buffer asks it to pause, sending keepalives
//! 4. Reconnects with backoff when the stream is lost
//!
//! # Reconnect
//!
//! ```text
//! stream lost → Reset to buffer (drop partial transactions)
//!             → connect at the last checkpoint
//!             → transactions ≤ checkpoint skipped by the reader,
//!               transactions ≤ last released dropped by the buffer
//! ```
//!
//! Decode errors are fatal: the coordinator moves to `Failed`.

use super::Shared;
use crate::error::{Result, SyncError};
use crate::event::Lsn;
use crate::metrics;
use crate::retry::{signalled, Clock, RetryConfig};
use crate::stream::{SourceConnector, StreamItem, StreamReader};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

/// What the reader sends to the buffer.
#[derive(Debug)]
pub(crate) enum ReaderMessage {
    Item(StreamItem),
    /// The connection was re-established; partial transactions are gone.
    Reset,
}

/// Everything the reader task needs besides the connection itself.
pub(crate) struct ReaderContext<C: SourceConnector> {
    pub connector: Arc<C>,
    pub item_tx: mpsc::Sender<ReaderMessage>,
    pub pause_rx: watch::Receiver<bool>,
    pub ack_rx: watch::Receiver<Lsn>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub keepalive_interval: Duration,
    pub reconnect_policy: RetryConfig,
    pub clock: Arc<dyn Clock>,
    pub shared: Arc<Shared>,
}

/// Connect, retrying retryable failures per `policy`.
///
/// Returns [`SyncError::Shutdown`] if shutdown is signalled while waiting.
pub(crate) async fn connect_with_retry<C: SourceConnector>(
    connector: &C,
    start: Lsn,
    policy: &RetryConfig,
    clock: &dyn Clock,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<C::Source> {
    let endpoint = connector.endpoint();
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        let error = match tokio::time::timeout(policy.connection_timeout, connector.connect(start))
            .await
        {
            Ok(Ok(source)) => {
                metrics::record_source_connect(true);
                info!(endpoint = %endpoint, start = %start, attempt, "Connected to replication source");
                return Ok(source);
            }
            Ok(Err(e)) if !e.is_retryable() => {
                metrics::record_source_connect(false);
                return Err(e);
            }
            Ok(Err(e)) => e,
            Err(_) => SyncError::connection(&endpoint, "connect timed out"),
        };
        metrics::record_source_connect(false);

        if !policy.allows_retry(attempt) {
            warn!(endpoint = %endpoint, attempt, error = %error, "Giving up connecting to source");
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            endpoint = %endpoint,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Source connect failed, retrying"
        );
        tokio::select! {
            biased;
            _ = signalled(shutdown_rx) => return Err(SyncError::Shutdown),
            _ = clock.sleep(delay) => {}
        }
    }
}

/// Run the reader until shutdown, a fatal error, or the buffer going away.
pub(crate) async fn run_reader<C: SourceConnector>(
    mut ctx: ReaderContext<C>,
    source: C::Source,
    start_lsn: Lsn,
) {
    let span = info_span!("reader", endpoint = %ctx.connector.endpoint());

    async move {
        info!(start = %start_lsn, "Starting change stream reader");
        let mut reader = StreamReader::new(source, start_lsn);

        loop {
            if *ctx.shutdown_rx.borrow() {
                break;
            }
            reader.acknowledge(*ctx.ack_rx.borrow_and_update());

            let outcome = if *ctx.pause_rx.borrow() {
                match wait_while_paused(&mut ctx, &mut reader).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => Err(e),
                }
            } else {
                tokio::select! {
                    biased;
                    _ = signalled(&mut ctx.shutdown_rx) => break,
                    item = reader.next_item() => item,
                }
            };

            match outcome {
                Ok(item) => {
                    let sent = tokio::select! {
                        biased;
                        _ = signalled(&mut ctx.shutdown_rx) => break,
                        sent = ctx.item_tx.send(ReaderMessage::Item(item)) => sent,
                    };
                    if sent.is_err() {
                        debug!("Buffer gone, reader stopping");
                        break;
                    }
                }
                Err(e) if e.is_retryable() => match reconnect(&mut ctx, e).await {
                    Some(fresh) => reader = fresh,
                    None => break,
                },
                Err(e) => {
                    ctx.shared.fail(&e);
                    break;
                }
            }
        }

        metrics::set_reader_paused(false);
        info!(
            received = %reader.received_lsn(),
            flushed = %reader.flushed_lsn(),
            "Change stream reader stopped"
        );
    }
    .instrument(span)
    .await
}

/// Hold off reading while the buffer is full.
///
/// Returns `Ok(true)` when resumed, `Ok(false)` on shutdown.
async fn wait_while_paused<C: SourceConnector>(
    ctx: &mut ReaderContext<C>,
    reader: &mut StreamReader<C::Source>,
) -> Result<bool> {
    debug!("Reader paused by backpressure");
    metrics::set_reader_paused(true);
    let mut keepalive = tokio::time::interval(ctx.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let resumed = loop {
        tokio::select! {
            biased;
            _ = signalled(&mut ctx.shutdown_rx) => break false,
            changed = ctx.pause_rx.changed() => {
                if changed.is_err() || !*ctx.pause_rx.borrow() {
                    break true;
                }
            }
            _ = keepalive.tick() => {
                reader.acknowledge(*ctx.ack_rx.borrow_and_update());
                reader.keepalive().await?;
            }
        }
    };

    metrics::set_reader_paused(false);
    if resumed {
        debug!("Reader resumed");
    }
    Ok(resumed)
}

/// Re-establish the stream at the last checkpoint.
///
/// Returns `None` if the reader should exit.
async fn reconnect<C: SourceConnector>(
    ctx: &mut ReaderContext<C>,
    cause: SyncError,
) -> Option<StreamReader<C::Source>> {
    warn!(error = %cause, "Replication stream lost, reconnecting");
    if ctx.item_tx.send(ReaderMessage::Reset).await.is_err() {
        return None;
    }

    let from = *ctx.ack_rx.borrow_and_update();
    let connected = connect_with_retry(
        &*ctx.connector,
        from,
        &ctx.reconnect_policy,
        &*ctx.clock,
        &mut ctx.shutdown_rx,
    )
    .await;

    match connected {
        Ok(source) => {
            metrics::record_reconnect();
            ctx.shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            info!(from = %from, "Replication stream re-established");
            let mut reader = StreamReader::new(source, from);
            reader.acknowledge(from);
            Some(reader)
        }
        Err(SyncError::Shutdown) => None,
        Err(e) => {
            ctx.shared.fail(&e);
            None
        }
    }
}
