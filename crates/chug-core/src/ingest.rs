//! Table ingestion: the end-to-end pipeline for one table, and the
//! fan-out scheduler for many.
//!
//! Per table: start the streaming extractor, probe primary keys when CDC is
//! on, synthesize and apply the destination DDL, pump the row channel into
//! the batched loader, then probe the extractor's error channel. When CDC
//! is enabled the ingestor hands the table to a poller governed by the same
//! cancellation signal and returns; the poller runs until cancelled.
//!
//! Tables run in parallel with no additional concurrency cap; the pool
//! sizes bound the effective parallelism. One table failing never cancels
//! the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ddl::{build_create_table, CdcKey};
use crate::error::Error;
use crate::types::{JobSpec, Row, TableSpec};
use crate::{poller, sink, source};

/// Pipeline phase reported by progress snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPhase {
    /// Rows are being pulled from the source
    Extract,
    /// Rows are being written to the destination
    Insert,
}

impl std::fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Extract => write!(f, "extract"),
            Self::Insert => write!(f, "insert"),
        }
    }
}

/// Lifecycle hooks for one ingestion run. All methods default to no-ops;
/// the engine proceeds identically whether or not an observer is attached.
pub trait IngestObserver: Send + Sync {
    /// A table's ingestion is starting.
    fn on_table_start(&self, _table: &str) {}
    /// Extraction began; the column count is known.
    fn on_extract_start(&self, _table: &str, _column_count: usize) {}
    /// Insertion into the destination began.
    fn on_insert_start(&self, _table: &str) {}
    /// Periodic snapshot (roughly every two seconds) of rows copied so far.
    /// `total` is the row cap when one is set, otherwise zero.
    fn on_progress(&self, _table: &str, _current: u64, _total: u64, _pct: f64, _phase: IngestPhase) {
    }
    /// The table finished successfully.
    fn on_table_complete(&self, _table: &str, _rows: u64, _duration: Duration) {}
    /// The table failed.
    fn on_table_error(&self, _table: &str, _error: &Error) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl IngestObserver for NoopObserver {}

/// Outcome of one table's ingestion.
#[derive(Debug)]
pub struct TableResult {
    /// Table name
    pub table: String,
    /// Whether the initial load completed
    pub success: bool,
    /// Rows copied during the initial load
    pub row_count: u64,
    /// Wall time of the initial load
    pub duration: Duration,
    /// Terminal error, when `success` is false
    pub error: Option<Error>,
}

impl TableResult {
    fn failed(table: impl Into<String>, duration: Duration, error: Error) -> Self {
        Self {
            table: table.into(),
            success: false,
            row_count: 0,
            duration,
            error: Some(error),
        }
    }
}

/// How often progress snapshots are emitted.
const PROGRESS_TICK: Duration = Duration::from_secs(2);

/// Ingest a single table end-to-end. On success with CDC enabled, a poller
/// is left running under `cancel` after this function returns.
pub async fn ingest_table(
    source_url: &str,
    dest_url: &str,
    spec: &TableSpec,
    observer: Arc<dyn IngestObserver>,
    cancel: CancellationToken,
) -> TableResult {
    let started = Instant::now();
    let table = spec.name.clone();

    let fail = |error: Error, started: Instant| {
        observer.on_table_error(&table, &error);
        TableResult::failed(table.as_str(), started.elapsed(), error)
    };

    if let Err(e) = spec.polling.validate() {
        return fail(e, started);
    }

    observer.on_table_start(&table);

    // 1. Streaming extraction.
    let handle = match source::extract(source_url, &table, spec.row_cap, cancel.clone()).await {
        Ok(handle) => handle,
        Err(e) => return fail(e, started),
    };
    observer.on_extract_start(&table, handle.columns.len());

    // 2. Primary key probe, best-effort: an empty key list just means the
    //    dedup hash covers all columns.
    let cdc = if spec.polling.enabled {
        let pk = source::primary_key_columns(source_url, &table)
            .await
            .unwrap_or_default();
        Some(CdcKey {
            delta_column: spec.polling.delta_column.clone(),
            primary_key_columns: pk,
        })
    } else {
        None
    };

    // 3. Destination DDL.
    let ddl = match build_create_table(&table, &handle.columns, cdc.as_ref()) {
        Ok(ddl) => ddl,
        Err(e) => return fail(e, started),
    };
    if let Err(e) = sink::create_table(dest_url, &table, &ddl).await {
        return fail(e, started);
    }

    observer.on_insert_start(&table);

    // 4. Pump extractor rows into the loader through a counting relay, so
    //    progress snapshots can see how far the copy has gotten.
    let copied = Arc::new(AtomicU64::new(0));
    let (relay_tx, relay_rx) = mpsc::channel::<Row>(100);
    let mut extractor_rows = handle.rows;
    let mut extractor_errors = handle.errors;
    let relay_counter = Arc::clone(&copied);
    tokio::spawn(async move {
        while let Some(row) = extractor_rows.recv().await {
            if relay_tx.send(row).await.is_err() {
                break;
            }
            relay_counter.fetch_add(1, Ordering::Relaxed);
        }
    });

    let ticker = {
        let observer = Arc::clone(&observer);
        let counter = Arc::clone(&copied);
        let table = table.clone();
        let total = if spec.row_cap > 0 { spec.row_cap as u64 } else { 0 };
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROGRESS_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let current = counter.load(Ordering::Relaxed);
                let pct = if total > 0 {
                    (current as f64 / total as f64) * 100.0
                } else {
                    0.0
                };
                observer.on_progress(&table, current, total, pct, IngestPhase::Insert);
            }
        })
    };

    let column_names: Vec<String> = handle.columns.iter().map(|c| c.name.clone()).collect();
    let load = sink::insert_streaming(
        dest_url,
        &table,
        &column_names,
        relay_rx,
        spec.batch_size,
        &cancel,
    )
    .await;
    ticker.abort();

    if let Err(e) = load {
        return fail(e, started);
    }

    // 5. Non-blocking probe: did the extractor end with an error?
    if let Ok(err) = extractor_errors.try_recv() {
        return fail(err, started);
    }

    let row_count = copied.load(Ordering::Relaxed);
    let duration = started.elapsed();
    observer.on_table_complete(&table, row_count, duration);
    info!(table = %table, rows = row_count, ?duration, "table ingested");

    // 6. Hand off to the poller; it outlives this call and stops with the
    //    shared cancellation signal.
    if spec.polling.enabled {
        poller::start_polling(source_url, dest_url, spec, None, cancel);
    }

    TableResult {
        table,
        success: true,
        row_count,
        duration,
        error: None,
    }
}

/// Ingest every table of the job in parallel and collect per-table
/// verdicts in completion order. A failed table never cancels the others;
/// deciding whether any failure fails the whole run is the caller's call.
pub async fn ingest_tables(
    job: &JobSpec,
    observer: Arc<dyn IngestObserver>,
    cancel: CancellationToken,
) -> Vec<TableResult> {
    let mut tasks = JoinSet::new();
    for spec in &job.tables {
        let source_url = job.source_url.clone();
        let dest_url = job.dest_url.clone();
        let spec = spec.clone();
        let observer = Arc::clone(&observer);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            ingest_table(&source_url, &dest_url, &spec, observer, cancel).await
        });
    }

    let mut results = Vec::with_capacity(job.tables.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => results.push(TableResult::failed(
                "<unknown>",
                Duration::ZERO,
                Error::config(format!("ingest task failed: {e}")),
            )),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PollingSpec;

    struct CountingObserver {
        errors: AtomicU64,
    }

    impl IngestObserver for CountingObserver {
        fn on_table_error(&self, _table: &str, _error: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_invalid_polling_spec_fails_before_any_io() {
        let spec = TableSpec {
            name: "evt".into(),
            row_cap: 0,
            batch_size: 100,
            polling: PollingSpec {
                enabled: true,
                delta_column: String::new(),
                interval: Duration::from_secs(1),
            },
        };
        let observer = Arc::new(CountingObserver {
            errors: AtomicU64::new(0),
        });

        let result = ingest_table(
            "postgres://unused",
            "http://unused",
            &spec,
            observer.clone(),
            CancellationToken::new(),
        )
        .await;

        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(IngestPhase::Extract.to_string(), "extract");
        assert_eq!(IngestPhase::Insert.to_string(), "insert");
    }

    #[test]
    fn test_progress_percentage_math() {
        let total = 200_u64;
        let current = 50_u64;
        let pct = (current as f64 / total as f64) * 100.0;
        assert!((pct - 25.0).abs() < f64::EPSILON);
    }
}
