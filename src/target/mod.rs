// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target database integration.
//!
//! The apply engine turns a [`Batch`](crate::batch::Batch) into a
//! [`PreparedBatch`] of key-addressed mutations and hands it to a
//! [`TargetDatabase`], which must execute it as a single atomic transaction.
//!
//! Implementations:
//! - [`PostgresTarget`]: a PostgreSQL pool (the production target)
//! - [`MemoryTarget`]: in-process tables, for tests and dry runs
//! - [`NoOpTarget`]: logs and discards
//!
//! # Example
//!
//! ```rust,no_run
//! use table_sync::target::{PreparedBatch, TargetDatabase, TargetFuture};
//!
//! struct AuditOnly;
//!
//! impl TargetDatabase for AuditOnly {
//!     fn apply_batch<'a>(&'a self, batch: &'a PreparedBatch) -> TargetFuture<'a, ()> {
//!         Box::pin(async move {
//!             println!("{} mutations in {}", batch.mutations.len(), batch.batch_id);
//!             Ok(())
//!         })
//!     }
//! }
//! ```

mod memory;
mod postgres;

pub use memory::{MemoryTarget, StoredRow};
pub use postgres::PostgresTarget;

use crate::event::{ColumnValue, Lsn};
use futures::future::BoxFuture;
use thiserror::Error;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type TargetFuture<'a, T> = BoxFuture<'a, Result<T, TargetError>>;

/// Failure applying a batch to the target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// The target rejected a mutation (schema mismatch, constraint).
    #[error("constraint violation on {table}: {message}")]
    ConstraintViolation { table: String, message: String },

    /// Lock timeout, deadlock, serialization failure.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Connection dropped or pool exhausted.
    #[error("connection failure: {0}")]
    Connection(String),
}

impl TargetError {
    pub fn constraint(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Check if retrying the same batch can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ConstraintViolation { .. })
    }
}

/// Mutation addressed by primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    /// Insert, or overwrite the row with the same key.
    ///
    /// `Unchanged` values leave the existing column alone.
    Upsert { row: Vec<(String, ColumnValue)> },
    /// Delete the row with this key, if there is one.
    Delete,
}

/// One statement's worth of work on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Target table, `schema.name`.
    pub table: String,
    /// Key columns and values, in key column order.
    pub key: Vec<(String, String)>,
    pub kind: MutationKind,
    /// Columns whose text values are JSON documents (`json`, `jsonb`).
    pub json_columns: Vec<String>,
}

impl Mutation {
    pub fn key_values(&self) -> Vec<String> {
        self.key.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn is_json_column(&self, column: &str) -> bool {
        self.json_columns.iter().any(|c| c == column)
    }
}

/// A batch translated into target mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBatch {
    pub batch_id: String,
    pub commit_lsn: Lsn,
    pub mutations: Vec<Mutation>,
}

/// Trait defining what we need from the target database.
///
/// `apply_batch` must be all-or-nothing: on error, none of the batch's
/// mutations may remain visible.
pub trait TargetDatabase: Send + Sync + 'static {
    /// Apply every mutation of the batch in one transaction.
    fn apply_batch<'a>(&'a self, batch: &'a PreparedBatch) -> TargetFuture<'a, ()>;

    /// Cheap liveness probe, for health checks.
    ///
    /// Default implementation returns `true`.
    fn ping(&self) -> TargetFuture<'_, bool> {
        Box::pin(async { Ok(true) })
    }
}

/// A no-op implementation for standalone mode.
///
/// Logs batches but doesn't write anything.
#[derive(Debug, Clone, Default)]
pub struct NoOpTarget;

impl TargetDatabase for NoOpTarget {
    fn apply_batch<'a>(&'a self, batch: &'a PreparedBatch) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(
                batch_id = %batch.batch_id,
                mutations = batch.mutations.len(),
                "NoOp: would apply batch"
            );
            Ok(())
        })
    }
}
