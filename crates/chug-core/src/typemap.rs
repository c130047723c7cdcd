//! Source-to-destination type mapping.
//!
//! A pure lookup from PostgreSQL `information_schema` type names to
//! ClickHouse column types. Unknown types fail closed: the DDL synthesizer
//! refuses to guess.
//!
//! Reference: <https://www.postgresql.org/docs/current/datatype.html>

use crate::error::Error;
use crate::types::Column;

/// Map a PostgreSQL type name to its ClickHouse column type, or `None` if
/// the type has no mapping.
///
/// `bytea` maps to `UUID` because the source driver surfaces uuid values as
/// 16-byte arrays; the extractor normalizes those payloads to UUID text.
pub fn destination_type(source_type: &str) -> Option<&'static str> {
    Some(match source_type {
        "integer" | "serial" => "Int32",
        "bigint" | "bigserial" => "Int64",
        "smallint" => "Int16",
        "boolean" => "Bool",
        "text" | "varchar" | "character varying" | "char" => "String",
        "date" => "Date",
        "timestamp" | "timestamp without time zone" | "timestamp with time zone" => "DateTime",
        "numeric" | "decimal" | "double precision" => "Float64",
        "real" => "Float32",
        "json" | "jsonb" => "String",
        "uuid" | "bytea" => "UUID",
        "inet" => "String",
        "USER-DEFINED" => "String",
        _ => return None,
    })
}

/// Map a column to its ClickHouse type, failing with `UnsupportedType` when
/// the source type is not in the table.
pub fn map_column(column: &Column) -> crate::Result<&'static str> {
    destination_type(&column.source_type)
        .ok_or_else(|| Error::unsupported_type(&column.name, &column.source_type))
}
