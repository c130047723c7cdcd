//! Source-side extraction (PostgreSQL).
//!
//! Provides:
//! - Schema introspection (columns, primary keys, table listing)
//! - Streaming extraction with a background producer and a bounded row
//!   channel (capacity 100) for backpressure
//! - Incremental extraction since a cursor value, ordered by the delta
//!   column
//! - Idempotent delta-column index creation for efficient polling
//!
//! The extractor is the only place that inspects value shape: uuid values
//! the driver surfaces as 16-byte payloads are normalized to canonical
//! hyphenated UUID text here, and nowhere else.

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::sync::mpsc;
use tokio_postgres::types::{FromSql, ToSql};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::pool::{source_pool, ConnectionFactory, PooledConn};
use crate::security::{ensure_valid_identifier, quote_identifier};
use crate::types::{Column, Row, TableData, Value};

/// Capacity of the row channel between producer and consumer.
const ROW_CHANNEL_CAPACITY: usize = 100;

/// A pooled PostgreSQL connection.
pub struct PgConn {
    client: tokio_postgres::Client,
}

impl PgConn {
    /// The underlying driver client.
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }
}

#[async_trait]
impl PooledConn for PgConn {
    async fn ping(&self) -> bool {
        self.client.simple_query("SELECT 1").await.is_ok()
    }
}

/// Factory for source connections.
pub struct PgFactory;

#[async_trait]
impl ConnectionFactory for PgFactory {
    type Conn = PgConn;

    async fn connect(&self, url: &str) -> crate::Result<PgConn> {
        let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connect_with_source("failed to connect to PostgreSQL", e))?;

        // The connection task owns the socket; it ends when the client drops.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "postgres connection task ended");
            }
        });

        Ok(PgConn { client })
    }
}

/// Handle to an in-flight streaming extraction.
///
/// The consumer reads `rows` until it closes, then drains `errors` for a
/// terminal error. Both channels are closed exactly once, when the producer
/// finishes, fails, or is cancelled.
pub struct StreamHandle {
    /// Columns in source ordinal order
    pub columns: Vec<Column>,
    /// Row channel (bounded, capacity 100)
    pub rows: mpsc::Receiver<Row>,
    /// Terminal error channel (at most one message)
    pub errors: mpsc::Receiver<Error>,
}

impl StreamHandle {
    /// Drain the stream into a materialized [`TableData`], surfacing any
    /// terminal error the producer reported.
    pub async fn collect(mut self) -> crate::Result<TableData> {
        let mut rows = Vec::new();
        while let Some(row) = self.rows.recv().await {
            rows.push(row);
        }
        if let Some(err) = self.errors.recv().await {
            return Err(err);
        }
        Ok(TableData {
            columns: self.columns,
            rows,
        })
    }
}

/// Owned SQL parameter for the background producer.
enum SqlParam {
    Text(String),
    Int(i64),
}

impl SqlParam {
    fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            Self::Text(s) => s,
            Self::Int(n) => n,
        }
    }
}

fn slice_iter<'a>(
    params: &'a [&'a (dyn ToSql + Sync)],
) -> impl ExactSizeIterator<Item = &'a dyn ToSql> + 'a {
    params.iter().map(|p| *p as _)
}

/// Column list for a table, ordered by ordinal position.
pub async fn table_columns(url: &str, table: &str) -> crate::Result<Vec<Column>> {
    let pool = source_pool(url).await?;
    let conn = pool.get().await?;

    let rows = conn
        .client()
        .query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = $1 ORDER BY ordinal_position",
            &[&table],
        )
        .await
        .map_err(|e| Error::extract(format!("failed to query columns for {table}: {e}")))?;

    Ok(rows
        .iter()
        .map(|r| Column::new(r.get::<_, String>(0), r.get::<_, String>(1)))
        .collect())
}

/// Primary key columns for a table, in key ordinal order. Best-effort
/// callers treat an error as "no primary key".
pub async fn primary_key_columns(url: &str, table: &str) -> crate::Result<Vec<String>> {
    let pool = source_pool(url).await?;
    let conn = pool.get().await?;

    let rows = conn
        .client()
        .query(
            "SELECT kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_name = $1 \
             ORDER BY kcu.ordinal_position",
            &[&table],
        )
        .await
        .map_err(|e| Error::extract(format!("failed to query primary key for {table}: {e}")))?;

    Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
}

/// Base tables in the public schema, sorted by name.
pub async fn list_tables(url: &str) -> crate::Result<Vec<String>> {
    let pool = source_pool(url).await?;
    let conn = pool.get().await?;

    let rows = conn
        .client()
        .query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            &[],
        )
        .await
        .map_err(|e| Error::extract(format!("failed to list tables: {e}")))?;

    Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
}

fn build_extract_sql(table: &str, row_cap: i64) -> crate::Result<(String, Vec<SqlParam>)> {
    ensure_valid_identifier(table)?;
    let mut sql = format!("SELECT * FROM {}", quote_identifier(table));
    let mut params = Vec::new();
    if row_cap > 0 {
        sql.push_str(" LIMIT $1");
        params.push(SqlParam::Int(row_cap));
    }
    Ok((sql, params))
}

fn build_extract_since_sql(
    table: &str,
    delta_column: &str,
    cast: &str,
    cursor: &str,
    row_cap: i64,
) -> crate::Result<(String, Vec<SqlParam>)> {
    ensure_valid_identifier(table)?;
    ensure_valid_identifier(delta_column)?;

    let delta = quote_identifier(delta_column);
    // The cursor travels as text; cast it server-side to the delta column's
    // own type so the comparison stays natively typed and index-friendly.
    let mut sql = format!(
        "SELECT * FROM {} WHERE {} > $1::{} ORDER BY {} ASC",
        quote_identifier(table),
        delta,
        cast,
        delta,
    );
    let mut params = vec![SqlParam::Text(cursor.to_string())];
    if row_cap > 0 {
        sql.push_str(" LIMIT $2");
        params.push(SqlParam::Int(row_cap));
    }
    Ok((sql, params))
}

/// The cast target for the `extract_since` cursor parameter: the delta
/// column's own information_schema type name.
fn delta_cast_type(columns: &[Column], table: &str, delta_column: &str) -> crate::Result<String> {
    let col = columns
        .iter()
        .find(|c| c.name == delta_column)
        .ok_or_else(|| {
            Error::extract(format!("delta column {delta_column:?} not found in {table:?}"))
        })?;

    // data_type names come from the information schema vocabulary; anything
    // outside letters, digits, underscores, and spaces is refused.
    let ok = !col.source_type.is_empty()
        && col
            .source_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ');
    if !ok {
        return Err(Error::extract(format!(
            "refusing to cast cursor to suspicious type {:?}",
            col.source_type
        )));
    }
    Ok(col.source_type.clone())
}

/// Stream every row of `table`, up to `row_cap` (`<= 0` = unlimited).
///
/// The row cap is a hard ceiling enforced by the source database via LIMIT,
/// not by the client.
pub async fn extract(
    url: &str,
    table: &str,
    row_cap: i64,
    cancel: CancellationToken,
) -> crate::Result<StreamHandle> {
    // Guard before anything touches the database.
    ensure_valid_identifier(table)?;
    let columns = table_columns(url, table).await?;
    let (sql, params) = build_extract_sql(table, row_cap)?;
    spawn_producer(url, columns, sql, params, cancel).await
}

/// Stream rows of `table` with `delta_column > cursor`, ascending by the
/// delta column, up to `row_cap` (`<= 0` = unlimited).
pub async fn extract_since(
    url: &str,
    table: &str,
    delta_column: &str,
    cursor: &str,
    row_cap: i64,
    cancel: CancellationToken,
) -> crate::Result<StreamHandle> {
    ensure_valid_identifier(table)?;
    ensure_valid_identifier(delta_column)?;
    let columns = table_columns(url, table).await?;
    let cast = delta_cast_type(&columns, table, delta_column)?;
    let (sql, params) = build_extract_since_sql(table, delta_column, &cast, cursor, row_cap)?;
    spawn_producer(url, columns, sql, params, cancel).await
}

async fn spawn_producer(
    url: &str,
    columns: Vec<Column>,
    sql: String,
    params: Vec<SqlParam>,
    cancel: CancellationToken,
) -> crate::Result<StreamHandle> {
    let pool = source_pool(url).await?;
    let (row_tx, row_rx) = mpsc::channel::<Row>(ROW_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel::<Error>(1);
    let producer_columns = columns.clone();

    tokio::spawn(async move {
        // Both channels close when these senders drop at the end of the
        // task, which is the consumer's end-of-stream signal.
        let conn = match pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                let _ = err_tx.try_send(err);
                return;
            }
        };

        let param_refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_sql()).collect();
        let stream = match conn
            .client()
            .query_raw(sql.as_str(), slice_iter(&param_refs))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = err_tx.try_send(Error::extract(format!("query failed: {e}")));
                return;
            }
        };
        futures::pin_mut!(stream);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = err_tx.try_send(Error::Cancelled);
                    return;
                }
                next = stream.try_next() => next,
            };

            match next {
                Ok(Some(pg_row)) => {
                    let mut row = row_values(&pg_row, &producer_columns);
                    normalize_row(&producer_columns, &mut row);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = err_tx.try_send(Error::Cancelled);
                            return;
                        }
                        sent = row_tx.send(row) => {
                            if sent.is_err() {
                                // Consumer went away; nothing left to report to.
                                return;
                            }
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let _ = err_tx.try_send(Error::extract(format!("row iteration failed: {e}")));
                    return;
                }
            }
        }
    });

    Ok(StreamHandle {
        columns,
        rows: row_rx,
        errors: err_rx,
    })
}

/// Idempotently create the B-tree index `idx_<table>_<delta>_chug` on the
/// delta column. Callers treat failure as a warning: polling still works
/// without the index, just slower.
pub async fn ensure_delta_index(url: &str, table: &str, delta_column: &str) -> crate::Result<()> {
    let index_err = |msg: String| Error::index_create(table, delta_column, msg);

    ensure_valid_identifier(table).map_err(|e| index_err(e.to_string()))?;
    ensure_valid_identifier(delta_column).map_err(|e| index_err(e.to_string()))?;
    let index_name = format!("idx_{table}_{delta_column}_chug");
    ensure_valid_identifier(&index_name).map_err(|e| index_err(e.to_string()))?;

    let pool = source_pool(url).await?;
    let conn = pool.get().await?;

    let row = conn
        .client()
        .query_one(
            "SELECT COUNT(*) FROM pg_indexes WHERE tablename = $1 AND indexname = $2",
            &[&table, &index_name],
        )
        .await
        .map_err(|e| index_err(format!("failed to check for index: {e}")))?;
    if row.get::<_, i64>(0) > 0 {
        return Ok(());
    }

    let create = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_identifier(&index_name),
        quote_identifier(table),
        quote_identifier(delta_column),
    );
    conn.client()
        .execute(create.as_str(), &[])
        .await
        .map_err(|e| index_err(format!("failed to create index: {e}")))?;

    Ok(())
}

/// `MAX(<delta_column>)` from the source table; `None` when the table is
/// empty.
pub async fn max_delta_value(
    url: &str,
    table: &str,
    delta_column: &str,
) -> crate::Result<Option<Value>> {
    ensure_valid_identifier(table)?;
    ensure_valid_identifier(delta_column)?;

    // The aggregate carries the delta column's own type, which drives the
    // fetch below.
    let columns = table_columns(url, table).await?;
    let source_type = columns
        .iter()
        .find(|c| c.name == delta_column)
        .map(|c| c.source_type.clone())
        .ok_or_else(|| {
            Error::extract(format!("delta column {delta_column:?} not found in {table:?}"))
        })?;

    let pool = source_pool(url).await?;
    let conn = pool.get().await?;

    let sql = format!(
        "SELECT MAX({}) FROM {}",
        quote_identifier(delta_column),
        quote_identifier(table),
    );
    let row = conn
        .client()
        .query_one(sql.as_str(), &[])
        .await
        .map_err(|e| Error::extract(format!("failed to query max delta value: {e}")))?;

    Ok(match column_value(&row, 0, &source_type) {
        Value::Null => None,
        value => Some(value),
    })
}

/// Convert one driver row into positional values, dispatching on the
/// information-schema types already discovered for the table.
fn row_values(row: &tokio_postgres::Row, columns: &[Column]) -> Row {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| column_value(row, i, &col.source_type))
        .collect()
}

/// Fetch one value, keyed off the same source-type vocabulary the type map
/// uses for DDL. SQL NULL and any fetch failure come back as `Null`; types
/// outside the vocabulary fall back to their text representation when the
/// driver can produce one.
fn column_value(row: &tokio_postgres::Row, idx: usize, source_type: &str) -> Value {
    fn fetch<'a, T>(row: &'a tokio_postgres::Row, idx: usize, wrap: fn(T) -> Value) -> Value
    where
        T: FromSql<'a>,
    {
        match row.try_get::<_, Option<T>>(idx) {
            Ok(Some(v)) => wrap(v),
            _ => Value::Null,
        }
    }

    match source_type {
        "boolean" => fetch(row, idx, Value::Bool),
        "smallint" => fetch(row, idx, Value::Int16),
        "integer" | "serial" => fetch(row, idx, Value::Int32),
        "bigint" | "bigserial" => fetch(row, idx, Value::Int64),
        "real" => fetch(row, idx, Value::Float32),
        "double precision" => fetch(row, idx, Value::Float64),
        "numeric" | "decimal" => fetch(row, idx, Value::Decimal),
        "date" => fetch(row, idx, Value::Date),
        "timestamp" | "timestamp without time zone" => fetch(row, idx, Value::DateTime),
        "timestamp with time zone" => fetch(row, idx, Value::DateTimeTz),
        "uuid" => fetch(row, idx, Value::Uuid),
        "bytea" => fetch(row, idx, Value::Bytes),
        "json" | "jsonb" => fetch(row, idx, Value::Json),
        _ => fetch(row, idx, Value::String),
    }
}

/// One pass over a row: uuid values the driver surfaced as 16-byte payloads
/// become canonical hyphenated UUIDs.
fn normalize_row(columns: &[Column], row: &mut Row) {
    for (i, col) in columns.iter().enumerate() {
        if col.source_type != "uuid" && col.source_type != "bytea" {
            continue;
        }
        let normalized = match row.get(i) {
            Some(Value::Bytes(bytes)) if bytes.len() == 16 => Uuid::from_slice(bytes).ok(),
            _ => None,
        };
        if let Some(uuid) = normalized {
            row[i] = Value::Uuid(uuid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_extract_sql() {
        let (sql, params) = build_extract_sql("users", 0).unwrap();
        assert_eq!(sql, "SELECT * FROM \"users\"");
        assert!(params.is_empty());

        let (sql, params) = build_extract_sql("users", 50).unwrap();
        assert_eq!(sql, "SELECT * FROM \"users\" LIMIT $1");
        assert_eq!(params.len(), 1);

        // Negative caps mean unlimited, same as zero.
        let (sql, _) = build_extract_sql("users", -1).unwrap();
        assert_eq!(sql, "SELECT * FROM \"users\"");
    }

    #[test]
    fn test_build_extract_since_sql() {
        let (sql, params) = build_extract_since_sql(
            "evt",
            "ts",
            "timestamp without time zone",
            "2024-01-01 00:00:00.000000",
            0,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"evt\" WHERE \"ts\" > $1::timestamp without time zone \
             ORDER BY \"ts\" ASC"
        );
        assert_eq!(params.len(), 1);

        let (sql, params) =
            build_extract_since_sql("evt", "ts", "bigint", "100", 500).unwrap();
        assert!(sql.ends_with("LIMIT $2"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_extract_sql_rejects_bad_identifiers() {
        assert!(build_extract_sql("users; DROP TABLE x", 0).is_err());
        assert!(build_extract_since_sql("t", "ts; --", "bigint", "0", 0).is_err());
    }

    #[test]
    fn test_delta_cast_type() {
        let columns = vec![
            Column::new("id", "integer"),
            Column::new("ts", "timestamp without time zone"),
        ];
        assert_eq!(
            delta_cast_type(&columns, "evt", "ts").unwrap(),
            "timestamp without time zone"
        );
        assert!(delta_cast_type(&columns, "evt", "missing").is_err());

        let evil = vec![Column::new("ts", "timestamp; DROP TABLE x")];
        assert!(delta_cast_type(&evil, "evt", "ts").is_err());
    }

    #[test]
    fn test_normalize_uuid_bytes() {
        let columns = vec![Column::new("id", "bytea"), Column::new("name", "text")];
        let uuid = Uuid::parse_str("6c0fa8b5-7f42-45e8-9c1a-0d9b2f0a3c11").unwrap();
        let mut row = vec![
            Value::Bytes(uuid.as_bytes().to_vec()),
            Value::String("x".into()),
        ];

        normalize_row(&columns, &mut row);
        assert_eq!(row[0], Value::Uuid(uuid));
        assert_eq!(row[0].render(), "6c0fa8b5-7f42-45e8-9c1a-0d9b2f0a3c11");
    }

    #[test]
    fn test_normalize_leaves_other_values_alone() {
        let columns = vec![Column::new("blob", "bytea"), Column::new("n", "integer")];
        // 3 bytes: not a uuid payload
        let mut row = vec![Value::Bytes(vec![1, 2, 3]), Value::Int32(9)];
        normalize_row(&columns, &mut row);
        assert_eq!(row[0], Value::Bytes(vec![1, 2, 3]));
        assert_eq!(row[1], Value::Int32(9));

        // 16 bytes but not a uuid-typed column
        let columns = vec![Column::new("s", "text")];
        let mut row = vec![Value::Bytes(vec![0u8; 16])];
        normalize_row(&columns, &mut row);
        assert_eq!(row[0], Value::Bytes(vec![0u8; 16]));
    }

    #[test]
    fn test_index_name_shape() {
        // The poller's index name is derived, not configured.
        let name = format!("idx_{}_{}_chug", "events", "updated_at");
        assert_eq!(name, "idx_events_updated_at_chug");
        assert!(crate::security::is_valid_identifier(&name));
    }
}
