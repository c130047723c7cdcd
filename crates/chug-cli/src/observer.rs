//! Logging observer for ingestion runs.

use chug_core::prelude::{IngestObserver, IngestPhase, TableResult};
use std::time::Duration;
use tracing::{error, info};

/// Observer that narrates table lifecycle and progress through tracing.
pub struct LogObserver;

impl IngestObserver for LogObserver {
    fn on_table_start(&self, table: &str) {
        info!(table, "starting ingestion");
    }

    fn on_extract_start(&self, table: &str, column_count: usize) {
        info!(table, columns = column_count, "streaming extraction started");
    }

    fn on_insert_start(&self, table: &str) {
        info!(table, "inserting into ClickHouse");
    }

    fn on_progress(&self, table: &str, current: u64, total: u64, pct: f64, phase: IngestPhase) {
        if total > 0 {
            let pct = format!("{pct:.1}");
            info!(table, rows = current, total, pct = %pct, %phase, "progress");
        } else {
            info!(table, rows = current, %phase, "progress");
        }
    }

    fn on_table_complete(&self, table: &str, rows: u64, duration: Duration) {
        info!(table, rows, ?duration, "table completed");
    }

    fn on_table_error(&self, table: &str, error: &chug_core::Error) {
        error!(table, %error, "table failed");
    }
}

/// Log a per-table summary. Returns `true` when every table succeeded.
pub fn log_summary(results: &[TableResult]) -> bool {
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut total_rows = 0u64;

    for result in results {
        if result.success {
            succeeded += 1;
            total_rows += result.row_count;
            info!(
                table = %result.table,
                rows = result.row_count,
                duration = ?result.duration,
                "table replicated"
            );
        } else {
            failed += 1;
            let reason = result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            error!(table = %result.table, error = %reason, "table failed");
        }
    }

    info!(
        tables = results.len(),
        succeeded,
        failed,
        total_rows,
        "ingestion finished"
    );
    failed == 0
}
