// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for the replication position.
//!
//! Stores, per sync set, the commit LSN of the last batch that was applied
//! to the target (or durably dead-lettered). On restart the reader resumes
//! from this LSN, so at most the last batch is delivered twice, and the
//! apply engine makes that harmless.
//!
//! ```text
//! apply batch 0/16B3 on target → write checkpoint 0/16B3 → ack 0/16B3 to source
//!                              (crash here = re-apply 0/16B3, idempotent)
//! ```
//!
//! The same database holds two more tables:
//!
//! - `leases`: one row per sync set naming the coordinator instance allowed
//!   to write checkpoints for it. A second instance fails to start while the
//!   lease is live.
//! - `dead_letters`: batches that exhausted their retries, with their events
//!   as JSON, so an operator can inspect and replay them.
//!
//! # Durability
//!
//! WAL journal with `synchronous = FULL`: a write has reached disk when
//! [`CheckpointStore::write`] returns. Writes are never debounced.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with bounded exponential backoff
//! before surfacing as [`SyncError::Storage`].

use crate::error::{Result, SyncError};
use crate::event::{ChangeEvent, Lsn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path that selects a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// SQLite integers are signed; LSNs past `i64::MAX` are refused rather
/// than wrapped, which would break the monotonic guard.
fn lsn_to_sql(lsn: Lsn) -> Result<i64> {
    i64::try_from(lsn.0)
        .map_err(|_| SyncError::Internal(format!("LSN {} out of storable range", lsn)))
}

fn lsn_from_sql(value: i64) -> Result<Lsn> {
    u64::try_from(value)
        .map(Lsn)
        .map_err(|_| SyncError::Internal(format!("negative LSN {} in checkpoint store", value)))
}

/// Last durably applied position of a sync set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Commit LSN of the last applied (or dead-lettered) batch.
    pub lsn: Lsn,
    pub applied_at: DateTime<Utc>,
}

/// Current lease row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// A batch set aside after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub batch_id: String,
    pub transaction_id: u32,
    pub commit_lsn: Lsn,
    pub attempts: usize,
    /// Last error seen.
    pub error: String,
    pub events: Vec<ChangeEvent>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Durable checkpoint, lease and dead-letter storage backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    set_name: String,
    path: String,
}

impl CheckpointStore {
    /// Open (or create) the store at `path` for `set_name`.
    ///
    /// [`IN_MEMORY_PATH`] opens a private in-memory database.
    pub async fn open(path: impl AsRef<Path>, set_name: &str) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, set_name, "Opening checkpoint store");

        let (options, max_connections) = if path_str == IN_MEMORY_PATH {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?;
            // Every in-memory connection is its own database.
            (options, 1)
        } else {
            let options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                    .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Full)
                    .busy_timeout(Duration::from_secs(1))
                    .create_if_missing(true);
            (options, 2)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                set_name TEXT PRIMARY KEY,
                lsn INTEGER NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                set_name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                set_name TEXT NOT NULL,
                batch_id TEXT NOT NULL,
                transaction_id INTEGER NOT NULL,
                commit_lsn INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                error TEXT NOT NULL,
                events TEXT NOT NULL,
                dead_lettered_at INTEGER NOT NULL,
                UNIQUE (set_name, batch_id)
            )
            "#,
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        let store = Self {
            pool,
            set_name: set_name.to_string(),
            path: path_str,
        };

        if let Some(checkpoint) = store.read().await? {
            info!(lsn = %checkpoint.lsn, "Restored checkpoint from previous run");
        }

        Ok(store)
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    // =========================================================================
    // Checkpoint
    // =========================================================================

    /// Last checkpoint, or `None` on first run.
    pub async fn read(&self) -> Result<Option<Checkpoint>> {
        let pool = &self.pool;
        let set_name = &self.set_name;
        let row: Option<(i64, i64)> = execute_with_retry("checkpoint_read", || async move {
            sqlx::query_as("SELECT lsn, applied_at FROM checkpoints WHERE set_name = ?")
                .bind(set_name)
                .fetch_optional(pool)
                .await
        })
        .await?;

        row.map(|(lsn, applied_at)| {
            Ok(Checkpoint {
                lsn: lsn_from_sql(lsn)?,
                applied_at: from_millis(applied_at),
            })
        })
        .transpose()
    }

    /// Persist a checkpoint. Durable on return.
    ///
    /// Re-writing the stored LSN is accepted; a lower LSN fails with
    /// [`SyncError::CheckpointRegression`] and leaves the store unchanged.
    pub async fn write(&self, checkpoint: Checkpoint) -> Result<()> {
        let start = Instant::now();
        let pool = &self.pool;
        let set_name = &self.set_name;
        let lsn = lsn_to_sql(checkpoint.lsn)?;
        let applied_at = to_millis(checkpoint.applied_at);

        let result = execute_with_retry("checkpoint_write", || async move {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (set_name, lsn, applied_at)
                VALUES (?, ?, ?)
                ON CONFLICT(set_name) DO UPDATE SET
                    lsn = excluded.lsn,
                    applied_at = excluded.applied_at
                WHERE excluded.lsn >= checkpoints.lsn
                "#,
            )
            .bind(set_name)
            .bind(lsn)
            .bind(applied_at)
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            let stored = self.read().await?.map(|c| c.lsn).unwrap_or(Lsn::ZERO);
            return Err(SyncError::CheckpointRegression {
                stored,
                attempted: checkpoint.lsn,
            });
        }

        crate::metrics::record_checkpoint_write(checkpoint.lsn, start.elapsed());
        debug!(lsn = %checkpoint.lsn, "Checkpoint written");
        Ok(())
    }

    // =========================================================================
    // Lease
    // =========================================================================

    /// Take the lease for this sync set.
    ///
    /// Succeeds if nobody holds it, the current lease has expired, or
    /// `holder` already holds it. Otherwise fails with
    /// [`SyncError::LeaseHeld`].
    pub async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<Lease> {
        let pool = &self.pool;
        let set_name = &self.set_name;
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let (now_ms, expires_ms) = (to_millis(now), to_millis(expires_at));

        let result = execute_with_retry("lease_acquire", || async move {
            sqlx::query(
                r#"
                INSERT INTO leases (set_name, holder, expires_at)
                VALUES (?, ?, ?)
                ON CONFLICT(set_name) DO UPDATE SET
                    holder = excluded.holder,
                    expires_at = excluded.expires_at
                WHERE leases.holder = excluded.holder OR leases.expires_at <= ?
                "#,
            )
            .bind(set_name)
            .bind(holder)
            .bind(expires_ms)
            .bind(now_ms)
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            let current = self.lease().await?;
            return Err(SyncError::LeaseHeld {
                set_name: self.set_name.clone(),
                holder: current.map(|l| l.holder).unwrap_or_default(),
            });
        }

        info!(set_name = %self.set_name, holder, ttl = ?ttl, "Lease acquired");
        Ok(Lease {
            holder: holder.to_string(),
            expires_at: from_millis(expires_ms),
        })
    }

    /// Extend a lease we hold. Fails with [`SyncError::LeaseHeld`] if it
    /// was taken over (or released) in the meantime.
    pub async fn renew_lease(&self, holder: &str, ttl: Duration) -> Result<Lease> {
        let pool = &self.pool;
        let set_name = &self.set_name;
        let expires_at =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let expires_ms = to_millis(expires_at);

        let result = execute_with_retry("lease_renew", || async move {
            sqlx::query("UPDATE leases SET expires_at = ? WHERE set_name = ? AND holder = ?")
                .bind(expires_ms)
                .bind(set_name)
                .bind(holder)
                .execute(pool)
                .await
        })
        .await?;

        if result.rows_affected() == 0 {
            let current = self.lease().await?;
            warn!(set_name = %self.set_name, holder, "Lease lost");
            return Err(SyncError::LeaseHeld {
                set_name: self.set_name.clone(),
                holder: current.map(|l| l.holder).unwrap_or_default(),
            });
        }

        debug!(set_name = %self.set_name, holder, "Lease renewed");
        Ok(Lease {
            holder: holder.to_string(),
            expires_at: from_millis(expires_ms),
        })
    }

    /// Give up the lease if we hold it. Releasing a lease held by someone
    /// else is a no-op.
    pub async fn release_lease(&self, holder: &str) -> Result<()> {
        let pool = &self.pool;
        let set_name = &self.set_name;
        let result = execute_with_retry("lease_release", || async move {
            sqlx::query("DELETE FROM leases WHERE set_name = ? AND holder = ?")
                .bind(set_name)
                .bind(holder)
                .execute(pool)
                .await
        })
        .await?;

        if result.rows_affected() > 0 {
            info!(set_name = %self.set_name, holder, "Lease released");
        }
        Ok(())
    }

    /// Current lease row, expired or not.
    pub async fn lease(&self) -> Result<Option<Lease>> {
        let pool = &self.pool;
        let set_name = &self.set_name;
        let row: Option<(String, i64)> = execute_with_retry("lease_read", || async move {
            sqlx::query_as("SELECT holder, expires_at FROM leases WHERE set_name = ?")
                .bind(set_name)
                .fetch_optional(pool)
                .await
        })
        .await?;
        Ok(row.map(|(holder, expires_at)| Lease {
            holder,
            expires_at: from_millis(expires_at),
        }))
    }

    // =========================================================================
    // Dead letters
    // =========================================================================

    /// Archive a dead-lettered batch. Durable on return.
    ///
    /// Recording the same batch twice keeps the first record, so a batch
    /// replayed after a crash is not archived again.
    pub async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<()> {
        let events = serde_json::to_string(&dead_letter.events)
            .map_err(|e| SyncError::Internal(format!("Failed to encode dead letter: {}", e)))?;
        let pool = &self.pool;
        let set_name = &self.set_name;
        let events = &events;
        let commit_lsn = lsn_to_sql(dead_letter.commit_lsn)?;

        execute_with_retry("dead_letter_insert", || async move {
            sqlx::query(
                r#"
                INSERT INTO dead_letters
                    (set_name, batch_id, transaction_id, commit_lsn, attempts, error, events, dead_lettered_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(set_name, batch_id) DO NOTHING
                "#,
            )
            .bind(set_name)
            .bind(&dead_letter.batch_id)
            .bind(dead_letter.transaction_id as i64)
            .bind(commit_lsn)
            .bind(dead_letter.attempts as i64)
            .bind(&dead_letter.error)
            .bind(events)
            .bind(to_millis(dead_letter.dead_lettered_at))
            .execute(pool)
            .await
        })
        .await?;

        warn!(
            batch_id = %dead_letter.batch_id,
            commit_lsn = %dead_letter.commit_lsn,
            attempts = dead_letter.attempts,
            events = dead_letter.events.len(),
            "Batch dead-lettered"
        );
        Ok(())
    }

    /// All dead letters of this sync set, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let pool = &self.pool;
        let set_name = &self.set_name;
        let rows = execute_with_retry("dead_letter_list", || async move {
            sqlx::query(
                r#"
                SELECT batch_id, transaction_id, commit_lsn, attempts, error, events, dead_lettered_at
                FROM dead_letters WHERE set_name = ? ORDER BY id
                "#,
            )
            .bind(set_name)
            .fetch_all(pool)
            .await
        })
        .await?;

        rows.into_iter()
            .map(|row| -> Result<DeadLetter> {
                let events: String = row.try_get("events")?;
                let events: Vec<ChangeEvent> = serde_json::from_str(&events).map_err(|e| {
                    SyncError::Internal(format!("Corrupt dead letter events: {}", e))
                })?;
                Ok(DeadLetter {
                    batch_id: row.try_get("batch_id")?,
                    transaction_id: row.try_get::<i64, _>("transaction_id")? as u32,
                    commit_lsn: lsn_from_sql(row.try_get("commit_lsn")?)?,
                    attempts: row.try_get::<i64, _>("attempts")? as usize,
                    error: row.try_get("error")?,
                    events,
                    dead_lettered_at: from_millis(row.try_get("dead_lettered_at")?),
                })
            })
            .collect()
    }

    pub async fn dead_letter_count(&self) -> Result<usize> {
        let pool = &self.pool;
        let set_name = &self.set_name;
        let (count,): (i64,) = execute_with_retry("dead_letter_count", || async move {
            sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE set_name = ?")
                .bind(set_name)
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(count as usize)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn wal_checkpoint(&self) -> Result<()> {
        if self.path == IN_MEMORY_PATH {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("wal_checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.wal_checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(set_name = %self.set_name, "Checkpoint store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
