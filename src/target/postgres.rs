//! PostgreSQL target.
//!
//! Values arrive in PostgreSQL's text representation. Rather than binding
//! each one with a guessed type, a mutation's values are bound as a single
//! JSON object and converted by the server through
//! `jsonb_populate_record(NULL::<table>, $1)`, which applies each column's
//! own input function. Values of `json` and `jsonb` columns are the
//! exception: the server copies them through unparsed, so they are embedded
//! as JSON documents rather than JSON strings.
//!
//! ```sql
//! INSERT INTO "public"."users" ("id", "name")
//! SELECT "id", "name" FROM jsonb_populate_record(NULL::"public"."users", $1::jsonb)
//! ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name"
//!
//! DELETE FROM "public"."users" AS t
//! USING jsonb_populate_record(NULL::"public"."users", $1::jsonb) AS k
//! WHERE t."id" = k."id"
//! ```

use super::{Mutation, MutationKind, PreparedBatch, TargetDatabase, TargetError, TargetFuture};
use crate::event::ColumnValue;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

/// Target backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresTarget {
    pool: PgPool,
}

impl PostgresTarget {
    /// Connect a pool to `url`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, TargetError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| classify("target", e))?;
        info!(max_connections, "Connected to target database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl TargetDatabase for PostgresTarget {
    fn apply_batch<'a>(&'a self, batch: &'a PreparedBatch) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("target", e))?;

            for mutation in &batch.mutations {
                let sql = statement_for(mutation);
                let payload = payload_for(mutation)?;
                sqlx::query(&sql)
                    .bind(payload)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify(&mutation.table, e))?;
            }

            tx.commit().await.map_err(|e| classify("target", e))?;
            debug!(
                batch_id = %batch.batch_id,
                mutations = batch.mutations.len(),
                "Batch committed on target"
            );
            Ok(())
        })
    }

    fn ping(&self) -> TargetFuture<'_, bool> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| true)
                .map_err(|e| classify("target", e))
        })
    }
}

// =============================================================================
// SQL generation
// =============================================================================

/// Quote an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote `schema.name` (or a bare name).
pub(crate) fn quote_table(table: &str) -> String {
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        None => quote_ident(table),
    }
}

pub(crate) fn statement_for(mutation: &Mutation) -> String {
    let table = quote_table(&mutation.table);
    let keys: Vec<String> = mutation.key.iter().map(|(c, _)| quote_ident(c)).collect();

    match &mutation.kind {
        MutationKind::Upsert { row } => {
            let others: Vec<String> = row
                .iter()
                .filter(|(c, v)| {
                    *v != ColumnValue::Unchanged && !mutation.key.iter().any(|(k, _)| k == c)
                })
                .map(|(c, _)| quote_ident(c))
                .collect();
            let columns: Vec<String> = keys.iter().chain(others.iter()).cloned().collect();
            let column_list = columns.join(", ");
            let conflict = if others.is_empty() {
                "DO NOTHING".to_string()
            } else {
                let sets: Vec<String> = others
                    .iter()
                    .map(|c| format!("{} = EXCLUDED.{}", c, c))
                    .collect();
                format!("DO UPDATE SET {}", sets.join(", "))
            };
            format!(
                "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{table}, $1::jsonb) ON CONFLICT ({keys}) {conflict}",
                table = table,
                cols = column_list,
                keys = keys.join(", "),
                conflict = conflict,
            )
        }
        MutationKind::Delete => {
            let matches: Vec<String> = keys
                .iter()
                .map(|k| format!("t.{} = k.{}", k, k))
                .collect();
            format!(
                "DELETE FROM {table} AS t USING jsonb_populate_record(NULL::{table}, $1::jsonb) AS k WHERE {cond}",
                table = table,
                cond = matches.join(" AND "),
            )
        }
    }
}

pub(crate) fn payload_for(mutation: &Mutation) -> Result<Value, TargetError> {
    let mut obj = Map::new();
    for (column, value) in &mutation.key {
        obj.insert(column.clone(), text_value(mutation, column, value)?);
    }
    if let MutationKind::Upsert { row } = &mutation.kind {
        for (column, value) in row {
            match value {
                ColumnValue::Text(v) => {
                    obj.insert(column.clone(), text_value(mutation, column, v)?);
                }
                ColumnValue::Null => {
                    obj.insert(column.clone(), Value::Null);
                }
                ColumnValue::Unchanged => {}
            }
        }
    }
    Ok(Value::Object(obj))
}

fn text_value(mutation: &Mutation, column: &str, text: &str) -> Result<Value, TargetError> {
    if !mutation.is_json_column(column) {
        return Ok(Value::String(text.to_string()));
    }
    serde_json::from_str(text).map_err(|e| {
        TargetError::constraint(
            &mutation.table,
            format!("column \"{}\" is not valid JSON: {}", column, e),
        )
    })
}

// =============================================================================
// Error classification
// =============================================================================

/// Map a sqlx error to retry semantics.
///
/// | SQLSTATE | Meaning | Class |
/// |----------|---------|-------|
/// | 22xxx | data exception (bad input value) | constraint |
/// | 23xxx | integrity constraint violation | constraint |
/// | 42xxx | undefined table/column, type mismatch | constraint |
/// | 08xxx | connection exception | connection |
/// | 40001, 40P01 | serialization failure, deadlock | transient |
/// | 55P03 | lock not available | transient |
/// | 57014 | statement timeout / cancel | transient |
/// | 53xxx | insufficient resources | transient |
/// | 57P0x | server shutting down | connection |
pub(crate) fn classify(table: &str, e: sqlx::Error) -> TargetError {
    match &e {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = format!("{} (SQLSTATE {})", db.message(), code);
            if code.starts_with("22") || code.starts_with("23") || code.starts_with("42") {
                TargetError::constraint(table, message)
            } else if code.starts_with("08") || code.starts_with("57P") {
                TargetError::Connection(message)
            } else {
                TargetError::Transient(message)
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => TargetError::Connection(e.to_string()),
        _ => TargetError::Transient(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(row: Vec<(&str, ColumnValue)>) -> Mutation {
        Mutation {
            table: "public.users".into(),
            key: vec![("id".into(), "1".into())],
            kind: MutationKind::Upsert {
                row: row.into_iter().map(|(c, v)| (c.to_string(), v)).collect(),
            },
            json_columns: vec![],
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_table("s.t"), "\"s\".\"t\"");
        assert_eq!(quote_table("t"), "\"t\"");
    }

    #[test]
    fn test_upsert_statement() {
        let m = upsert(vec![("id", ColumnValue::text("1")), ("name", ColumnValue::text("a"))]);
        let sql = statement_for(&m);
        assert!(sql.starts_with("INSERT INTO \"public\".\"users\" (\"id\", \"name\")"));
        assert!(sql.contains("jsonb_populate_record(NULL::\"public\".\"users\", $1::jsonb)"));
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""));
    }

    #[test]
    fn test_upsert_skips_unchanged_columns() {
        let m = upsert(vec![
            ("name", ColumnValue::text("a")),
            ("blob", ColumnValue::Unchanged),
        ]);
        let sql = statement_for(&m);
        assert!(!sql.contains("blob"));
        let payload = payload_for(&m).unwrap();
        assert!(payload.get("blob").is_none());
    }

    #[test]
    fn test_key_only_upsert_does_nothing_on_conflict() {
        let m = upsert(vec![("id", ColumnValue::text("1"))]);
        assert!(statement_for(&m).ends_with("DO NOTHING"));
    }

    #[test]
    fn test_delete_statement() {
        let m = Mutation {
            table: "public.pairs".into(),
            key: vec![("a".into(), "1".into()), ("b".into(), "2".into())],
            kind: MutationKind::Delete,
            json_columns: vec![],
        };
        let sql = statement_for(&m);
        assert!(sql.starts_with("DELETE FROM \"public\".\"pairs\" AS t"));
        assert!(sql.ends_with("WHERE t.\"a\" = k.\"a\" AND t.\"b\" = k.\"b\""));
        assert_eq!(payload_for(&m).unwrap(), serde_json::json!({"a": "1", "b": "2"}));
    }

    #[test]
    fn test_payload_nulls() {
        let m = upsert(vec![("name", ColumnValue::Null)]);
        assert_eq!(payload_for(&m).unwrap(), serde_json::json!({"id": "1", "name": null}));
    }

    #[test]
    fn test_payload_embeds_json_documents() {
        let mut m = upsert(vec![
            ("attrs", ColumnValue::text(r#"{"a":1,"tags":["x"]}"#)),
            ("name", ColumnValue::text(r#"{"a":1}"#)),
        ]);
        m.json_columns = vec!["attrs".into()];
        assert_eq!(
            payload_for(&m).unwrap(),
            serde_json::json!({
                "id": "1",
                "attrs": {"a": 1, "tags": ["x"]},
                "name": "{\"a\":1}",
            })
        );
    }

    #[test]
    fn test_payload_json_scalar_and_null() {
        let mut m = upsert(vec![
            ("attrs", ColumnValue::text("\"plain\"")),
            ("extra", ColumnValue::Null),
        ]);
        m.json_columns = vec!["attrs".into(), "extra".into()];
        assert_eq!(
            payload_for(&m).unwrap(),
            serde_json::json!({"id": "1", "attrs": "plain", "extra": null})
        );
    }

    #[test]
    fn test_payload_rejects_malformed_json() {
        let mut m = upsert(vec![("attrs", ColumnValue::text("{not json"))]);
        m.json_columns = vec!["attrs".into()];
        assert!(matches!(
            payload_for(&m),
            Err(TargetError::ConstraintViolation { .. })
        ));
    }

    #[test]
    fn test_classify_non_database_errors() {
        assert!(matches!(
            classify("t", sqlx::Error::PoolTimedOut),
            TargetError::Connection(_)
        ));
        assert!(matches!(
            classify("t", sqlx::Error::RowNotFound),
            TargetError::Transient(_)
        ));
    }
}
