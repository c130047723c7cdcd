//! Destination DDL synthesis.
//!
//! Builds the `CREATE TABLE IF NOT EXISTS` statement for one table from the
//! discovered source columns. Plain tables get a `MergeTree` with a neutral
//! sort key. CDC tables get a materialized dedup key hashed from the logical
//! primary key and a `ReplacingMergeTree` versioned on the delta column, so
//! replayed rows collapse during background merges and at-least-once
//! delivery stays idempotent.

use crate::error::Error;
use crate::security::{ensure_valid_identifier, quote_identifier};
use crate::typemap::map_column;
use crate::types::Column;

/// Synthesized dedup column injected into CDC tables.
pub const DEDUP_COLUMN: &str = "_dedup_key";

/// CDC shape of a destination table: which column versions rows, and which
/// columns form the logical primary key for the dedup hash.
#[derive(Debug, Clone)]
pub struct CdcKey {
    /// Delta column used as the replacing engine's version
    pub delta_column: String,
    /// Primary key columns; empty means "hash all columns"
    pub primary_key_columns: Vec<String>,
}

/// Build the destination `CREATE TABLE IF NOT EXISTS` statement.
///
/// Column order in the output matches source ordinal order exactly. All
/// identifiers pass the guard and are emitted through the quoter.
pub fn build_create_table(table: &str, columns: &[Column], cdc: Option<&CdcKey>) -> crate::Result<String> {
    ensure_valid_identifier(table)?;
    if columns.is_empty() {
        return Err(Error::empty_columns(table));
    }

    let mut defs = Vec::with_capacity(columns.len() + 1);
    for col in columns {
        ensure_valid_identifier(&col.name)?;
        defs.push(format!("{} {}", quote_identifier(&col.name), map_column(col)?));
    }

    let (engine, order_by) = match cdc {
        Some(key) => {
            ensure_valid_identifier(&key.delta_column)?;

            // Hash the logical primary key into a fixed-width sort key;
            // fall back to all columns when no primary key was found.
            let hash_cols: Vec<String> = if key.primary_key_columns.is_empty() {
                columns.iter().map(|c| quote_identifier(&c.name)).collect()
            } else {
                key.primary_key_columns
                    .iter()
                    .map(|c| {
                        ensure_valid_identifier(c)?;
                        Ok(quote_identifier(c))
                    })
                    .collect::<crate::Result<_>>()?
            };

            defs.push(format!(
                "{} UInt64 MATERIALIZED cityHash64(tuple({}))",
                DEDUP_COLUMN,
                hash_cols.join(", ")
            ));

            (
                format!("ReplacingMergeTree({})", quote_identifier(&key.delta_column)),
                DEDUP_COLUMN.to_string(),
            )
        }
        None => ("MergeTree()".to_string(), "tuple()".to_string()),
    };

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = {} ORDER BY {};",
        quote_identifier(table),
        defs.join(", "),
        engine,
        order_by,
    ))
}
