//! chug - replicate PostgreSQL tables into ClickHouse, then keep them
//! fresh by polling a delta column.

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chug_core::prelude::*;

mod config;
mod observer;

use config::{Config, TableConfig, DEFAULT_CONFIG_PATH, SAMPLE_CONFIG};
use observer::LogObserver;

#[derive(Parser)]
#[command(name = "chug")]
#[command(about = "Replicate PostgreSQL tables into ClickHouse with optional change polling")]
#[command(version)]
struct Cli {
    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy tables from PostgreSQL to ClickHouse, optionally polling for
    /// changes afterwards
    Ingest {
        /// Path to a YAML config file (default: .chug.yaml)
        #[arg(long)]
        config: Option<String>,

        /// PostgreSQL connection URL
        #[arg(long = "pg-url")]
        pg_url: Option<String>,

        /// ClickHouse connection URL
        #[arg(long = "ch-url")]
        ch_url: Option<String>,

        /// Single table to ingest
        #[arg(long)]
        table: Option<String>,

        /// Comma-separated list of tables (e.g. users,orders,products)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,

        /// Row cap for the initial load (0 = unlimited)
        #[arg(long)]
        limit: Option<i64>,

        /// Rows per ClickHouse INSERT
        #[arg(long = "batch-size")]
        batch_size: Option<usize>,

        /// Keep polling for changes after the initial ingest
        #[arg(long)]
        poll: bool,

        /// Column to track changes on (usually a timestamp)
        #[arg(long = "poll-delta")]
        poll_delta: Option<String>,

        /// Polling interval in seconds
        #[arg(long = "poll-interval")]
        poll_interval: Option<u64>,
    },

    /// Poll one table for changes and replicate them, without an initial
    /// load
    Poll {
        /// PostgreSQL connection URL
        #[arg(long = "pg-url")]
        pg_url: String,

        /// ClickHouse connection URL
        #[arg(long = "ch-url")]
        ch_url: String,

        /// Table to poll
        #[arg(long)]
        table: String,

        /// Column to track changes on
        #[arg(long = "delta-column")]
        delta_column: String,

        /// Polling interval in seconds
        #[arg(long, default_value_t = 5)]
        interval: u64,

        /// Per-poll row cap (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        limit: i64,

        /// Rows per ClickHouse INSERT
        #[arg(long = "batch-size", default_value_t = 500)]
        batch_size: usize,

        /// Cursor to start from; omitted means the current MAX of the
        /// delta column
        #[arg(long = "start-from")]
        start_from: Option<String>,
    },

    /// Export a ClickHouse table to CSV
    Export {
        /// ClickHouse connection URL
        #[arg(long = "ch-url")]
        ch_url: String,

        /// Table to export
        #[arg(long)]
        table: String,

        /// Output path (default: <table>.csv)
        #[arg(long)]
        out: Option<String>,
    },

    /// List the base tables available in the source database
    Tables {
        /// PostgreSQL connection URL
        #[arg(long = "pg-url")]
        pg_url: String,
    },

    /// Verify connectivity to the configured databases
    Check {
        /// PostgreSQL connection URL
        #[arg(long = "pg-url")]
        pg_url: Option<String>,

        /// ClickHouse connection URL
        #[arg(long = "ch-url")]
        ch_url: Option<String>,
    },

    /// Write an annotated starter config file
    SampleConfig {
        /// Where to write the file (default: .chug.yaml)
        #[arg(long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log, which wins over the "info" default.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Ingest {
            config,
            pg_url,
            ch_url,
            table,
            tables,
            limit,
            batch_size,
            poll,
            poll_delta,
            poll_interval,
        } => {
            run_ingest(IngestArgs {
                config,
                pg_url,
                ch_url,
                table,
                tables,
                limit,
                batch_size,
                poll,
                poll_delta,
                poll_interval,
            })
            .await
        }
        Commands::Poll {
            pg_url,
            ch_url,
            table,
            delta_column,
            interval,
            limit,
            batch_size,
            start_from,
        } => {
            run_poll(
                pg_url,
                ch_url,
                table,
                delta_column,
                interval,
                limit,
                batch_size,
                start_from,
            )
            .await
        }
        Commands::Export { ch_url, table, out } => run_export(ch_url, table, out).await,
        Commands::Tables { pg_url } => run_tables(pg_url).await,
        Commands::Check { pg_url, ch_url } => run_check(pg_url, ch_url).await,
        Commands::SampleConfig { path, force } => run_sample_config(path, force),
    }
}

struct IngestArgs {
    config: Option<String>,
    pg_url: Option<String>,
    ch_url: Option<String>,
    table: Option<String>,
    tables: Option<Vec<String>>,
    limit: Option<i64>,
    batch_size: Option<usize>,
    poll: bool,
    poll_delta: Option<String>,
    poll_interval: Option<u64>,
}

async fn run_ingest(args: IngestArgs) -> anyhow::Result<()> {
    let mut cfg = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!(error = %err, "could not load config file, falling back to flags");
            Config::default()
        }
    };

    // Flags override file values.
    if let Some(url) = args.pg_url {
        cfg.pg_url = url;
    }
    if let Some(url) = args.ch_url {
        cfg.ch_url = url;
    }
    if let Some(limit) = args.limit {
        cfg.limit = limit;
    }
    if let Some(batch_size) = args.batch_size {
        cfg.batch_size = batch_size;
    }
    if args.poll {
        cfg.polling.enabled = true;
    }
    if let Some(delta) = args.poll_delta {
        cfg.polling.delta_column = delta;
    }
    if let Some(interval) = args.poll_interval {
        cfg.polling.interval_seconds = interval;
    }
    if let Some(names) = args.tables {
        cfg.tables = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(|n| TableConfig {
                name: n.to_string(),
                ..Default::default()
            })
            .collect();
    } else if let Some(name) = args.table {
        cfg.table = name;
    }

    let job = cfg.to_job()?;
    info!(tables = job.tables.len(), "starting ingestion");

    let cancel = CancellationToken::new();
    spawn_ctrlc_watcher(cancel.clone());

    let results = ingest_tables(&job, Arc::new(LogObserver), cancel.clone()).await;
    let all_ok = observer::log_summary(&results);
    if !all_ok {
        close_all().await;
        std::process::exit(1);
    }

    if job.tables.iter().any(|t| t.polling.enabled) {
        info!("polling active, press Ctrl-C to stop");
        cancel.cancelled().await;
    }

    close_all().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_poll(
    pg_url: String,
    ch_url: String,
    table: String,
    delta_column: String,
    interval: u64,
    limit: i64,
    batch_size: usize,
    start_from: Option<String>,
) -> anyhow::Result<()> {
    let spec = TableSpec::new(&table, limit, batch_size)
        .with_polling(&delta_column, Duration::from_secs(interval));
    spec.polling.validate()?;

    let cancel = CancellationToken::new();
    spawn_ctrlc_watcher(cancel.clone());

    info!(%table, %delta_column, interval, "starting standalone poll loop");
    let poller = chug_core::poller::start_polling(&pg_url, &ch_url, &spec, start_from, cancel);
    let _ = poller.await;

    close_all().await;
    Ok(())
}

async fn run_export(ch_url: String, table: String, out: Option<String>) -> anyhow::Result<()> {
    let out = out.unwrap_or_else(|| format!("{table}.csv"));
    let rows = export_table_csv(&ch_url, &table, Path::new(&out)).await?;
    info!(%table, rows, output = %out, "export complete");
    close_all().await;
    Ok(())
}

async fn run_tables(pg_url: String) -> anyhow::Result<()> {
    let tables = list_tables(&pg_url).await?;
    if tables.is_empty() {
        info!("no base tables found in the public schema");
    }
    for table in tables {
        println!("{table}");
    }
    close_all().await;
    Ok(())
}

async fn run_check(pg_url: Option<String>, ch_url: Option<String>) -> anyhow::Result<()> {
    if pg_url.is_none() && ch_url.is_none() {
        bail!("nothing to check: pass --pg-url and/or --ch-url");
    }

    let mut failed = false;
    if let Some(url) = pg_url {
        match source_pool(&url).await {
            Ok(_) => info!("PostgreSQL connection OK"),
            Err(err) => {
                error!(error = %err, "PostgreSQL connection failed");
                failed = true;
            }
        }
    }
    if let Some(url) = ch_url {
        match dest_pool(&url).await {
            Ok(_) => info!("ClickHouse connection OK"),
            Err(err) => {
                error!(error = %err, "ClickHouse connection failed");
                failed = true;
            }
        }
    }

    close_all().await;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn run_sample_config(path: Option<String>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    if Path::new(&path).exists() && !force {
        bail!("{path} already exists, pass --force to overwrite");
    }
    std::fs::write(&path, SAMPLE_CONFIG)?;
    info!(%path, "wrote sample config");
    Ok(())
}

fn spawn_ctrlc_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            cancel.cancel();
        }
    });
}
