//! In-process target tables.
//!
//! Rows are keyed by their primary key values. A batch is applied to a copy
//! of the affected tables and swapped in only if every mutation succeeds,
//! which gives the same all-or-nothing behavior as a database transaction.

use super::{Mutation, MutationKind, PreparedBatch, TargetDatabase, TargetError, TargetFuture};
use crate::event::ColumnValue;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Column name to value; `None` is SQL NULL.
pub type StoredRow = BTreeMap<String, Option<String>>;

type Table = BTreeMap<Vec<String>, StoredRow>;

/// In-memory target database.
#[derive(Default)]
pub struct MemoryTarget {
    tables: Mutex<HashMap<String, Table>>,
    /// Declared schemas. When non-empty, unknown tables or columns are
    /// constraint violations.
    schemas: HashMap<String, HashSet<String>>,
    /// Failures to return from the next `apply_batch` calls.
    injected: Mutex<VecDeque<TargetError>>,
    calls: AtomicUsize,
    applied: Mutex<Vec<String>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table and its columns; enables schema checking.
    pub fn with_table(mut self, table: &str, columns: &[&str]) -> Self {
        self.schemas.insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    /// Make the next `times` calls to `apply_batch` fail with `error`.
    pub async fn fail_next(&self, times: usize, error: TargetError) {
        let mut injected = self.injected.lock().await;
        for _ in 0..times {
            injected.push_back(error.clone());
        }
    }

    /// Rows of a table, in key order.
    pub async fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Row with the given key values.
    pub async fn row(&self, table: &str, key: &[&str]) -> Option<StoredRow> {
        let key: Vec<String> = key.iter().map(|k| k.to_string()).collect();
        self.tables
            .lock()
            .await
            .get(table)
            .and_then(|t| t.get(&key).cloned())
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, |t| t.len())
    }

    /// Full snapshot of all tables.
    pub async fn snapshot(&self) -> HashMap<String, Vec<StoredRow>> {
        self.tables
            .lock()
            .await
            .iter()
            .map(|(name, t)| (name.clone(), t.values().cloned().collect()))
            .collect()
    }

    /// Number of `apply_batch` calls, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids of successfully applied batches, in order.
    pub async fn applied_batches(&self) -> Vec<String> {
        self.applied.lock().await.clone()
    }

    fn check_schema(&self, mutation: &Mutation) -> Result<(), TargetError> {
        if self.schemas.is_empty() {
            return Ok(());
        }
        let columns = self.schemas.get(&mutation.table).ok_or_else(|| {
            TargetError::constraint(&mutation.table, "relation does not exist")
        })?;
        let mut names: Vec<&String> = mutation.key.iter().map(|(c, _)| c).collect();
        if let MutationKind::Upsert { row } = &mutation.kind {
            names.extend(row.iter().map(|(c, _)| c));
        }
        match names.into_iter().find(|c| !columns.contains(*c)) {
            Some(missing) => Err(TargetError::constraint(
                &mutation.table,
                format!("column \"{}\" does not exist", missing),
            )),
            None => Ok(()),
        }
    }

    fn apply_one(tables: &mut HashMap<String, Table>, mutation: &Mutation) {
        let key = mutation.key_values();
        let table = tables.entry(mutation.table.clone()).or_default();
        match &mutation.kind {
            MutationKind::Upsert { row } => {
                let stored = table.entry(key).or_default();
                for (column, value) in &mutation.key {
                    stored.insert(column.clone(), Some(value.clone()));
                }
                for (column, value) in row {
                    match value {
                        ColumnValue::Text(v) => {
                            stored.insert(column.clone(), Some(v.clone()));
                        }
                        ColumnValue::Null => {
                            stored.insert(column.clone(), None);
                        }
                        ColumnValue::Unchanged => {}
                    }
                }
            }
            MutationKind::Delete => {
                table.remove(&key);
            }
        }
    }
}

impl TargetDatabase for MemoryTarget {
    fn apply_batch<'a>(&'a self, batch: &'a PreparedBatch) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.injected.lock().await.pop_front() {
                return Err(err);
            }

            for mutation in &batch.mutations {
                self.check_schema(mutation)?;
            }

            let mut tables = self.tables.lock().await;
            let mut staged = tables.clone();
            for mutation in &batch.mutations {
                Self::apply_one(&mut staged, mutation);
            }
            *tables = staged;
            drop(tables);

            self.applied.lock().await.push(batch.batch_id.clone());
            Ok(())
        })
    }
}
