//! Apply engine: change events to idempotent target mutations.
//!
//! Every operation is addressed by primary key, so applying a batch a
//! second time leaves the target exactly as the first application did:
//!
//! | Event | Mutation |
//! |-------|----------|
//! | insert | upsert by key |
//! | update | upsert by key (delete old key first if the key changed) |
//! | delete | delete by key if exists |
//!
//! This is what makes batch-granularity checkpointing safe: after a crash
//! the last batch may be delivered again, and re-applying it is a no-op.

use crate::batch::Batch;
use crate::config::TargetConfig;
use crate::error::{Result, SyncError};
use crate::event::{ChangeEvent, ColumnValue, Operation, RowImage, TableId};
use crate::metrics;
use crate::target::{Mutation, MutationKind, PreparedBatch, TargetDatabase};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Where and how a source table lands on the target.
#[derive(Debug, Clone, Default)]
struct TableRoute {
    /// Target table name, if renamed.
    target: Option<String>,
    /// Key columns, if overriding the source's replica identity.
    key_columns: Option<Vec<String>>,
}

/// Translates batches into mutations and applies them atomically.
pub struct ApplyEngine<T: TargetDatabase> {
    target: Arc<T>,
    routes: HashMap<TableId, TableRoute>,
}

impl<T: TargetDatabase> ApplyEngine<T> {
    /// Create an engine with table renames and key overrides from config.
    pub fn new(target: Arc<T>, config: &TargetConfig) -> Self {
        let mut routes: HashMap<TableId, TableRoute> = HashMap::new();
        for (source, target_name) in &config.table_mappings {
            routes.entry(TableId::parse(source)).or_default().target = Some(target_name.clone());
        }
        for (source, keys) in &config.key_columns {
            routes.entry(TableId::parse(source)).or_default().key_columns = Some(keys.clone());
        }
        Self { target, routes }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    /// Translate a batch into mutations, in event order.
    ///
    /// Fails with [`SyncError::ConstraintViolation`] if a table has no key
    /// or an image lacks a key value: no idempotent mapping exists.
    pub fn prepare(&self, batch: &Batch) -> Result<PreparedBatch> {
        let mut mutations = Vec::with_capacity(batch.events.len());
        for event in &batch.events {
            self.mutations_for(event, &mut mutations)?;
        }
        Ok(PreparedBatch {
            batch_id: batch.id.clone(),
            commit_lsn: batch.commit_lsn,
            mutations,
        })
    }

    /// Apply a prepared batch as one transaction.
    #[instrument(skip_all, fields(batch_id = %prepared.batch_id, mutations = prepared.mutations.len()))]
    pub async fn apply(&self, prepared: &PreparedBatch) -> Result<()> {
        let start = Instant::now();
        let result = self.target.apply_batch(prepared).await;
        metrics::record_apply_latency(start.elapsed(), result.is_ok());
        result.map_err(SyncError::from)?;
        debug!("Batch applied");
        Ok(())
    }

    /// Prepare and apply.
    pub async fn apply_batch(&self, batch: &Batch) -> Result<()> {
        let prepared = self.prepare(batch)?;
        self.apply(&prepared).await
    }

    fn route(&self, table: &TableId) -> (String, Option<&[String]>) {
        match self.routes.get(table) {
            Some(route) => (
                route.target.clone().unwrap_or_else(|| table.to_string()),
                route.key_columns.as_deref(),
            ),
            None => (table.to_string(), None),
        }
    }

    fn mutations_for(&self, event: &ChangeEvent, out: &mut Vec<Mutation>) -> Result<()> {
        let (table, key_override) = self.route(&event.table);
        let key_columns = key_override.unwrap_or(&event.key_columns);
        if key_columns.is_empty() {
            return Err(SyncError::constraint(
                &table,
                "no primary key columns; set REPLICA IDENTITY or configure key_columns",
            ));
        }

        match event.operation {
            Operation::Insert | Operation::Update => {
                let after = event.after_image.as_ref().ok_or_else(|| {
                    SyncError::constraint(&table, format!("{} without new row", event.operation))
                })?;
                let key = key_of(&table, key_columns, after)?;

                if event.operation == Operation::Update {
                    if let Some(before) = &event.before_image {
                        let old_key = key_of(&table, key_columns, before)?;
                        if old_key != key {
                            out.push(Mutation {
                                table: table.clone(),
                                key: old_key,
                                kind: MutationKind::Delete,
                                json_columns: json_columns(event),
                            });
                        }
                    }
                }

                let row = after
                    .iter()
                    .filter(|(column, _)| !key_columns.contains(*column))
                    .map(|(column, value)| (column.clone(), value.clone()))
                    .collect();
                out.push(Mutation {
                    table,
                    key,
                    kind: MutationKind::Upsert { row },
                    json_columns: json_columns(event),
                });
            }
            Operation::Delete => {
                let before = event.before_image.as_ref().ok_or_else(|| {
                    SyncError::constraint(&table, "delete without old key")
                })?;
                out.push(Mutation {
                    key: key_of(&table, key_columns, before)?,
                    table,
                    kind: MutationKind::Delete,
                    json_columns: json_columns(event),
                });
            }
        }
        Ok(())
    }
}

fn json_columns(event: &ChangeEvent) -> Vec<String> {
    event
        .column_types
        .keys()
        .filter(|column| event.is_json_column(column))
        .cloned()
        .collect()
}

fn key_of(table: &str, key_columns: &[String], image: &RowImage) -> Result<Vec<(String, String)>> {
    key_columns
        .iter()
        .map(|column| match image.get(column) {
            Some(ColumnValue::Text(v)) => Ok((column.clone(), v.clone())),
            Some(ColumnValue::Null) => Err(SyncError::constraint(
                table,
                format!("key column \"{}\" is NULL", column),
            )),
            Some(ColumnValue::Unchanged) | None => Err(SyncError::constraint(
                table,
                format!("key column \"{}\" missing from row image", column),
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommitMarker, Lsn};
    use crate::target::{MemoryTarget, TargetError};
    use chrono::{DateTime, Utc};

    fn row(pairs: &[(&str, &str)]) -> RowImage {
        pairs
            .iter()
            .map(|(c, v)| (c.to_string(), ColumnValue::text(*v)))
            .collect()
    }

    fn event(op: Operation, before: Option<RowImage>, after: Option<RowImage>) -> ChangeEvent {
        ChangeEvent {
            transaction_id: 1,
            lsn: Lsn(1),
            table: TableId::new("public", "users"),
            key_columns: vec!["id".into()],
            operation: op,
            before_image: before,
            after_image: after,
            commit_timestamp: DateTime::<Utc>::UNIX_EPOCH,
            column_types: Default::default(),
        }
    }

    fn batch(events: Vec<ChangeEvent>) -> Batch {
        let marker = CommitMarker {
            transaction_id: 1,
            commit_lsn: Lsn(0x100),
            end_lsn: Lsn(0x108),
            commit_timestamp: DateTime::<Utc>::UNIX_EPOCH,
        };
        Batch {
            id: Batch::id_for(1, marker.commit_lsn),
            transaction_id: 1,
            commit_lsn: marker.commit_lsn,
            end_lsn: marker.end_lsn,
            commit_timestamp: marker.commit_timestamp,
            events,
        }
    }

    fn engine() -> ApplyEngine<MemoryTarget> {
        ApplyEngine::new(Arc::new(MemoryTarget::new()), &TargetConfig::default())
    }

    #[test]
    fn test_insert_maps_to_upsert() {
        let prepared = engine()
            .prepare(&batch(vec![event(
                Operation::Insert,
                None,
                Some(row(&[("id", "1"), ("name", "a")])),
            )]))
            .unwrap();
        assert_eq!(prepared.mutations.len(), 1);
        let m = &prepared.mutations[0];
        assert_eq!(m.table, "public.users");
        assert_eq!(m.key, vec![("id".to_string(), "1".to_string())]);
        assert_eq!(
            m.kind,
            MutationKind::Upsert {
                row: vec![("name".to_string(), ColumnValue::text("a"))]
            }
        );
    }

    #[test]
    fn test_key_change_deletes_old_key_first() {
        let prepared = engine()
            .prepare(&batch(vec![event(
                Operation::Update,
                Some(row(&[("id", "1")])),
                Some(row(&[("id", "2"), ("name", "a")])),
            )]))
            .unwrap();
        assert_eq!(prepared.mutations.len(), 2);
        assert_eq!(prepared.mutations[0].kind, MutationKind::Delete);
        assert_eq!(prepared.mutations[0].key_values(), vec!["1".to_string()]);
        assert_eq!(prepared.mutations[1].key_values(), vec!["2".to_string()]);
    }

    #[test]
    fn test_delete_uses_before_image() {
        let prepared = engine()
            .prepare(&batch(vec![event(
                Operation::Delete,
                Some(row(&[("id", "7")])),
                None,
            )]))
            .unwrap();
        assert_eq!(prepared.mutations[0].kind, MutationKind::Delete);
        assert_eq!(prepared.mutations[0].key_values(), vec!["7".to_string()]);
    }

    #[test]
    fn test_missing_key_is_constraint_violation() {
        let mut e = event(Operation::Insert, None, Some(row(&[("name", "a")])));
        let err = engine().prepare(&batch(vec![e.clone()])).unwrap_err();
        assert!(matches!(err, SyncError::ConstraintViolation { .. }));

        e.key_columns.clear();
        e.after_image = Some(row(&[("id", "1")]));
        let err = engine().prepare(&batch(vec![e])).unwrap_err();
        assert!(err.to_string().contains("no primary key"));
    }

    #[test]
    fn test_json_columns_follow_source_types() {
        let mut e = event(
            Operation::Insert,
            None,
            Some(row(&[("id", "1"), ("name", "a"), ("attrs", "{\"a\":1}")])),
        );
        e.column_types = [
            ("id".to_string(), 23),
            ("name".to_string(), 25),
            ("attrs".to_string(), crate::event::JSONB_OID),
        ]
        .into();
        let prepared = engine().prepare(&batch(vec![e])).unwrap();
        assert_eq!(prepared.mutations[0].json_columns, vec!["attrs".to_string()]);
        assert!(!prepared.mutations[0].is_json_column("name"));
    }

    #[test]
    fn test_routes_rename_and_override_keys() {
        let mut config = TargetConfig::default();
        config
            .table_mappings
            .insert("public.users".into(), "archive.users_copy".into());
        config
            .key_columns
            .insert("public.users".into(), vec!["email".into()]);
        let engine = ApplyEngine::new(Arc::new(MemoryTarget::new()), &config);

        let mut e = event(
            Operation::Insert,
            None,
            Some(row(&[("id", "1"), ("email", "a@x")])),
        );
        e.key_columns.clear();
        let prepared = engine.prepare(&batch(vec![e])).unwrap();
        assert_eq!(prepared.mutations[0].table, "archive.users_copy");
        assert_eq!(prepared.mutations[0].key_values(), vec!["a@x".to_string()]);
    }

    #[tokio::test]
    async fn test_insert_update_delete_leaves_no_row() {
        let engine = engine();
        let b = batch(vec![
            event(Operation::Insert, None, Some(row(&[("id", "1"), ("name", "a")]))),
            event(Operation::Update, None, Some(row(&[("id", "1"), ("name", "b")]))),
            event(Operation::Delete, Some(row(&[("id", "1")])), None),
        ]);
        engine.apply_batch(&b).await.unwrap();
        assert!(engine.target().row("public.users", &["1"]).await.is_none());
    }

    #[tokio::test]
    async fn test_reapplying_batch_is_idempotent() {
        let engine = engine();
        let b = batch(vec![
            event(Operation::Insert, None, Some(row(&[("id", "1"), ("name", "a")]))),
            event(Operation::Insert, None, Some(row(&[("id", "2"), ("name", "b")]))),
            event(Operation::Update, None, Some(row(&[("id", "1"), ("name", "c")]))),
        ]);
        engine.apply_batch(&b).await.unwrap();
        let once = engine.target().snapshot().await;
        engine.apply_batch(&b).await.unwrap();
        assert_eq!(engine.target().snapshot().await, once);
    }

    #[tokio::test]
    async fn test_target_errors_are_classified() {
        let engine = engine();
        engine
            .target()
            .fail_next(1, TargetError::Transient("deadlock detected".into()))
            .await;
        let b = batch(vec![event(Operation::Insert, None, Some(row(&[("id", "1")])))]);
        let err = engine.apply_batch(&b).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
