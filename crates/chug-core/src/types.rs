//! Value and descriptor types for chug-core
//!
//! The row model is deliberately small: a row is a positional tuple of
//! tagged values, one per column in source ordinal order. The extractor is
//! the only place that inspects value shape (for UUID normalization); the
//! loader passes values through unchanged.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use uuid::Uuid;

/// A single database value as it travels from source to destination
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER, SERIAL)
    Int32(i32),
    /// 64-bit signed integer (BIGINT, BIGSERIAL)
    Int64(i64),
    /// 64-bit unsigned integer (synthesized values, never read from the source)
    UInt64(u64),
    /// 32-bit float (REAL)
    Float32(f32),
    /// 64-bit float (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text (TEXT, VARCHAR, CHAR, INET, unknown types)
    String(String),
    /// Raw bytes (BYTEA that is not a 16-byte UUID payload)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID (native, or normalized from a 16-byte payload)
    Uuid(Uuid),
    /// JSON document (JSON, JSONB)
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to view as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::UInt64(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Render this value the way the poll cursor and CSV export expect it:
    /// timestamps as `YYYY-MM-DD HH:MM:SS.ffffff`, numbers in plain decimal,
    /// strings verbatim, UUIDs hyphenated.
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int16(n) => n.to_string(),
            Self::Int32(n) => n.to_string(),
            Self::Int64(n) => n.to_string(),
            Self::UInt64(n) => n.to_string(),
            Self::Float32(n) => n.to_string(),
            Self::Float64(n) => n.to_string(),
            Self::Decimal(d) => d.to_string(),
            Self::String(s) => s.clone(),
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::DateTime(ts) => ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            Self::DateTimeTz(ts) => ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            Self::Uuid(u) => u.to_string(),
            Self::Json(j) => j.to_string(),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// A row: one value per column, in source ordinal order
pub type Row = Vec<Value>;

/// Column descriptor as discovered from the source information schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Source type name, verbatim from `information_schema.columns.data_type`
    pub source_type: String,
}

impl Column {
    /// Create a column descriptor
    pub fn new(name: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
        }
    }
}

/// A fully materialized extraction result (columns plus all rows)
#[derive(Debug, Clone, Default)]
pub struct TableData {
    /// Columns in source ordinal order
    pub columns: Vec<Column>,
    /// Rows in the order the source returned them
    pub rows: Vec<Row>,
}

impl TableData {
    /// Index of the named column, if present
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Column names in ordinal order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Polling (CDC) settings for one table
#[derive(Debug, Clone, Default)]
pub struct PollingSpec {
    /// Whether this table is continuously replicated after the initial load
    pub enabled: bool,
    /// Monotonically non-decreasing column used as the poll cursor
    pub delta_column: String,
    /// Fixed poll interval
    pub interval: Duration,
}

impl PollingSpec {
    /// Check the invariant: enabled polling needs a delta column and a
    /// positive interval.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.delta_column.is_empty() {
            return Err(crate::Error::config(
                "polling is enabled but no delta column is set",
            ));
        }
        if self.interval.is_zero() {
            return Err(crate::Error::config(
                "polling is enabled but the interval is zero",
            ));
        }
        Ok(())
    }
}

/// Resolved per-table replication settings. Defaults have already been
/// merged by the caller; the engine treats missing values as programmer
/// errors.
#[derive(Debug, Clone)]
pub struct TableSpec {
    /// Source (and destination) table name
    pub name: String,
    /// Row ceiling for extraction; `<= 0` means unlimited
    pub row_cap: i64,
    /// Rows per destination INSERT statement
    pub batch_size: usize,
    /// CDC polling settings
    pub polling: PollingSpec,
}

impl TableSpec {
    /// Create a non-polling spec with the given cap and batch size
    pub fn new(name: impl Into<String>, row_cap: i64, batch_size: usize) -> Self {
        Self {
            name: name.into(),
            row_cap,
            batch_size,
            polling: PollingSpec::default(),
        }
    }

    /// Enable polling on this spec
    pub fn with_polling(mut self, delta_column: impl Into<String>, interval: Duration) -> Self {
        self.polling = PollingSpec {
            enabled: true,
            delta_column: delta_column.into(),
            interval,
        };
        self
    }
}

/// A resolved replication job: both endpoints plus the tables to copy
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Source PostgreSQL connection URL
    pub source_url: String,
    /// Destination ClickHouse connection URL
    pub dest_url: String,
    /// Tables to replicate
    pub tables: Vec<TableSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_value_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int32(0).is_null());
    }

    #[test]
    fn test_value_render_timestamp() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_micro_opt(12, 30, 45, 123456)
            .unwrap();
        assert_eq!(Value::DateTime(ts).render(), "2024-03-09 12:30:45.123456");
    }

    #[test]
    fn test_value_render_scalars() {
        assert_eq!(Value::Int64(42).render(), "42");
        assert_eq!(Value::Float64(1.5).render(), "1.5");
        assert_eq!(Value::String("abc".into()).render(), "abc");
        assert_eq!(Value::Null.render(), "");
    }

    #[test]
    fn test_value_from_option() {
        let v: Value = None::<i32>.into();
        assert!(v.is_null());
        let v: Value = Some(7_i32).into();
        assert_eq!(v, Value::Int32(7));
    }

    #[test]
    fn test_table_data_column_index() {
        let data = TableData {
            columns: vec![Column::new("id", "integer"), Column::new("ts", "timestamp")],
            rows: vec![],
        };
        assert_eq!(data.column_index("ts"), Some(1));
        assert_eq!(data.column_index("missing"), None);
    }

    #[test]
    fn test_polling_spec_validation() {
        assert!(PollingSpec::default().validate().is_ok());

        let bad = PollingSpec {
            enabled: true,
            delta_column: String::new(),
            interval: Duration::from_secs(1),
        };
        assert!(bad.validate().is_err());

        let bad = PollingSpec {
            enabled: true,
            delta_column: "ts".into(),
            interval: Duration::ZERO,
        };
        assert!(bad.validate().is_err());

        let good = PollingSpec {
            enabled: true,
            delta_column: "ts".into(),
            interval: Duration::from_secs(5),
        };
        assert!(good.validate().is_ok());
    }
}
