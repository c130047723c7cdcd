//! CSV export of destination tables.
//!
//! Pulls every stored column of a ClickHouse table as text and writes a CSV
//! with a header row. Materialized columns (the dedup key) are excluded, so
//! an exported CDC table looks like its source.

use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::error::Error;
use crate::pool::dest_pool;
use crate::security::{ensure_valid_identifier, quote_identifier};
use crate::sink;

/// One result row: every column already rendered to text server-side.
#[derive(clickhouse::Row, Deserialize)]
struct TextRow {
    fields: Vec<String>,
}

/// Export `table` from the destination to a CSV file at `out_path`.
/// Returns the number of data rows written.
pub async fn export_table_csv(dest_url: &str, table: &str, out_path: &Path) -> crate::Result<u64> {
    ensure_valid_identifier(table)?;

    if !sink::table_exists(dest_url, table).await? {
        return Err(Error::extract(format!(
            "table {table:?} does not exist in the destination"
        )));
    }

    let columns = sink::stored_columns(dest_url, table).await?;
    if columns.is_empty() {
        return Err(Error::empty_columns(table));
    }

    // Render every column to text server-side and fetch each row as one
    // Array(String), so the shape is uniform regardless of column types.
    let rendered: Vec<String> = columns
        .iter()
        .map(|c| {
            ensure_valid_identifier(c)?;
            Ok(format!("toString({})", quote_identifier(c)))
        })
        .collect::<crate::Result<_>>()?;
    let sql = format!(
        "SELECT [{}] AS fields FROM {}",
        rendered.join(", "),
        quote_identifier(table),
    );

    let file = std::fs::File::create(out_path)
        .map_err(|e| Error::config(format!("could not create {}: {e}", out_path.display())))?;
    let mut writer = csv::Writer::from_writer(file);
    writer
        .write_record(&columns)
        .map_err(|e| Error::config(format!("could not write CSV header: {e}")))?;

    let pool = dest_pool(dest_url).await?;
    let conn = pool.get().await?;
    let mut cursor = conn
        .client()
        .query(&sql)
        .fetch::<TextRow>()
        .map_err(|e| Error::extract(format!("export query failed: {e}")))?;

    let mut count = 0u64;
    while let Some(row) = cursor
        .next()
        .await
        .map_err(|e| Error::extract(format!("export row fetch failed: {e}")))?
    {
        writer
            .write_record(&row.fields)
            .map_err(|e| Error::config(format!("could not write CSV row: {e}")))?;
        count += 1;
        if count % 500 == 0 {
            info!(table, rows = count, "exported rows so far");
        }
    }

    writer
        .flush()
        .map_err(|e| Error::config(format!("could not flush CSV output: {e}")))?;
    info!(table, rows = count, output = %out_path.display(), "exported table to CSV");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_select_shape() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rendered: Vec<String> = columns
            .iter()
            .map(|c| format!("toString({})", quote_identifier(c)))
            .collect();
        let sql = format!(
            "SELECT [{}] AS fields FROM {}",
            rendered.join(", "),
            quote_identifier("users"),
        );
        assert_eq!(
            sql,
            "SELECT [toString(\"id\"), toString(\"name\")] AS fields FROM \"users\""
        );
    }

    #[test]
    fn test_csv_rendering() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["id", "name"]).unwrap();
        writer.write_record(["1", "O'Brien\""]).unwrap();
        writer.write_record(["2", ""]).unwrap();
        let out = String::from_utf8(writer.into_inner().unwrap()).unwrap();

        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("id,name"));
        // Quotes are escaped by the writer, empties stay empty.
        assert_eq!(lines.next(), Some("1,\"O'Brien\"\"\""));
        assert_eq!(lines.next(), Some("2,"));
    }
}
