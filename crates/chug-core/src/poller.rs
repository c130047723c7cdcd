//! Delta-column polling (CDC).
//!
//! A poller tails one table: on every tick it extracts rows with
//! `delta_column > cursor`, hands them to its data handler, and only then
//! advances the cursor to the greatest delta value in the batch. Handler
//! failure keeps the cursor where it was, so the next tick re-extracts the
//! same rows; together with the destination's replacing engine this gives
//! at-least-once delivery with idempotent absorption.
//!
//! The strict `>` predicate requires the delta column to be strictly
//! increasing per row. Rows that share an already-committed cursor value
//! are not re-delivered.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::types::{TableData, TableSpec};
use crate::{sink, source};

/// Cursor used when the source has no rows yet or the seed query fails.
pub const EPOCH_CURSOR: &str = "1970-01-01 00:00:00";

/// Handler invoked with each non-empty polled batch. The poller advances
/// its cursor only when the handler returns `Ok`.
pub type DataHandler =
    Arc<dyn Fn(TableData) -> BoxFuture<'static, crate::Result<()>> + Send + Sync>;

/// Poll loop settings for one table.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Table to tail
    pub table: String,
    /// Monotonic cursor column
    pub delta_column: String,
    /// Fixed tick interval
    pub interval: Duration,
    /// Per-poll row ceiling (`<= 0` = unlimited)
    pub row_cap: i64,
    /// Starting cursor; when `None` the poller seeds itself from
    /// `MAX(delta_column)` on the source, falling back to the epoch
    pub start_from: Option<String>,
}

/// A cursor-driven poll loop for one table.
pub struct Poller {
    source_url: String,
    config: PollConfig,
    on_data: DataHandler,
}

impl Poller {
    /// Create a poller. It does nothing until [`Poller::run`] is called.
    pub fn new(source_url: impl Into<String>, config: PollConfig, on_data: DataHandler) -> Self {
        Self {
            source_url: source_url.into(),
            config,
            on_data,
        }
    }

    /// Run until the cancellation token fires, then return `Cancelled`.
    pub async fn run(&self, cancel: CancellationToken) -> crate::Result<()> {
        let table = self.config.table.as_str();
        let delta = self.config.delta_column.as_str();

        let mut cursor = match &self.config.start_from {
            Some(start) if !start.is_empty() => start.clone(),
            _ => self.seed_cursor().await,
        };

        info!(
            table,
            delta_column = delta,
            interval_ms = self.config.interval.as_millis() as u64,
            cursor = %cursor,
            "starting poller"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; consume it
        // so polls start one interval after the initial load.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(table, "poller stopping (cancelled)");
                    return Err(Error::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            debug!(table, cursor = %cursor, "polling for new rows");
            let data = match source::extract_since(
                &self.source_url,
                table,
                delta,
                &cursor,
                self.config.row_cap,
                cancel.clone(),
            )
            .await
            {
                Ok(handle) => match handle.collect().await {
                    Ok(data) => data,
                    Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
                    Err(e) => {
                        error!(table, error = %e, "poll extraction failed");
                        continue;
                    }
                },
                Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
                Err(e) => {
                    error!(table, error = %e, "poll extraction failed");
                    continue;
                }
            };

            if data.rows.is_empty() {
                debug!(table, cursor = %cursor, "no new rows");
                continue;
            }

            let Some(delta_idx) = data.column_index(delta) else {
                error!(table, delta_column = delta, "delta column missing from extraction");
                continue;
            };
            // Extraction is ordered ascending by the delta column, so the
            // batch maximum is the last row.
            let next_cursor = data
                .rows
                .last()
                .and_then(|row| row.get(delta_idx))
                .map(|value| value.render());
            let row_count = data.rows.len();

            if let Err(e) = (self.on_data)(data).await {
                if e.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                error!(table, error = %e, "failed to dispatch polled batch, cursor not advanced");
                continue;
            }

            if let Some(next) = next_cursor {
                cursor = next;
            }
            info!(table, rows = row_count, cursor = %cursor, "replicated polled batch");
        }
    }

    /// Compute the starting cursor: `MAX(delta)` from the source, or the
    /// epoch when the table is empty or the query fails.
    async fn seed_cursor(&self) -> String {
        match source::max_delta_value(
            &self.source_url,
            &self.config.table,
            &self.config.delta_column,
        )
        .await
        {
            Ok(Some(value)) => value.render(),
            Ok(None) => EPOCH_CURSOR.to_string(),
            Err(e) => {
                warn!(
                    table = %self.config.table,
                    error = %e,
                    "could not determine max delta value, starting from epoch"
                );
                EPOCH_CURSOR.to_string()
            }
        }
    }
}

/// Spawn the poll loop the table ingestor hands off to: ensure the delta
/// index (warning-only), then replicate each polled batch into the
/// destination with the table's batch size.
pub fn start_polling(
    source_url: &str,
    dest_url: &str,
    spec: &TableSpec,
    start_from: Option<String>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let source_url = source_url.to_string();
    let dest_url = dest_url.to_string();
    let spec = spec.clone();

    tokio::spawn(async move {
        if let Err(err) =
            source::ensure_delta_index(&source_url, &spec.name, &spec.polling.delta_column).await
        {
            warn!(
                table = %spec.name,
                error = %err,
                "could not create delta column index, polling will be slower"
            );
        }

        let on_data: DataHandler = {
            let dest_url = dest_url.clone();
            let table = spec.name.clone();
            let batch_size = spec.batch_size;
            let handler_cancel = cancel.clone();
            Arc::new(move |data: TableData| {
                let dest_url = dest_url.clone();
                let table = table.clone();
                let cancel = handler_cancel.clone();
                Box::pin(async move {
                    let columns = data.column_names();
                    sink::insert(&dest_url, &table, &columns, &data.rows, batch_size, &cancel)
                        .await
                        .map(|_| ())
                }) as BoxFuture<'static, crate::Result<()>>
            })
        };

        let poller = Poller::new(
            source_url,
            PollConfig {
                table: spec.name.clone(),
                delta_column: spec.polling.delta_column.clone(),
                interval: spec.polling.interval,
                row_cap: spec.row_cap,
                start_from,
            },
            on_data,
        );

        match poller.run(cancel).await {
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(table = %spec.name, error = %e, "poller stopped with error"),
            Ok(()) => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use chrono::NaiveDate;

    #[test]
    fn test_epoch_cursor_shape() {
        assert_eq!(EPOCH_CURSOR, "1970-01-01 00:00:00");
    }

    #[test]
    fn test_cursor_rendering_matches_contract() {
        let ts = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_micro_opt(8, 15, 0, 42)
            .unwrap();
        assert_eq!(Value::DateTime(ts).render(), "2024-06-01 08:15:00.000042");
        assert_eq!(Value::Int64(1234).render(), "1234");
        assert_eq!(Value::String("v9".into()).render(), "v9");
    }

    #[test]
    fn test_batch_maximum_is_last_row() {
        // extract_since orders ascending by the delta column.
        let data = TableData {
            columns: vec![
                crate::types::Column::new("id", "integer"),
                crate::types::Column::new("seq", "bigint"),
            ],
            rows: vec![
                vec![Value::Int32(1), Value::Int64(10)],
                vec![Value::Int32(2), Value::Int64(11)],
                vec![Value::Int32(3), Value::Int64(15)],
            ],
        };
        let idx = data.column_index("seq").unwrap();
        let cursor = data.rows.last().and_then(|r| r.get(idx)).unwrap().render();
        assert_eq!(cursor, "15");
    }
}
