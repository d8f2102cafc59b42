// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Historian CLI
//!
//! Stages readings durably and publishes them to a JSON lines file.
//!
//! # Usage
//!
//! ```bash
//! # Relay newline-delimited raw messages from stdin
//! bus-tap | hdds-historian --db historian_backup.db --output published.jsonl
//!
//! # Inspect the staging database
//! hdds-historian --db historian_backup.db pending --limit 10
//! hdds-historian --db historian_backup.db stats
//!
//! # Evaluate a time expression
//! hdds-historian time '("1/1/2020", now -1d)'
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hdds_historian::{
    parse_time_query, Config, ConfigBuilder, HistorianService, JsonLinesSink, RawMessage,
    SqliteStagingStore, StagingStore, TimeBound,
};
use std::io::BufRead;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hdds-historian")]
#[command(about = "HDDS Historian - durable time-series relay", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Staging database path (SQLite file)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Published entries file (JSON lines)
    #[arg(short, long, default_value = "historian_published.jsonl")]
    output: PathBuf,

    /// Wait for new input at most this long before retrying (ms)
    #[arg(long)]
    retry_period_ms: Option<u64>,

    /// Maximum entries per publish call
    #[arg(long)]
    submit_size_limit: Option<usize>,

    /// Publishing budget before input is rechecked (ms)
    #[arg(long)]
    max_time_publishing_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Relay raw messages from stdin (default)
    Run,
    /// Show the oldest outstanding entries
    Pending {
        /// Maximum entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show statistics
    Stats,
    /// List interned topics
    Topics,
    /// Evaluate a time expression
    Time {
        /// Expression, e.g. "now -1d" or '("1/1/2020", now)'
        expr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, args.output).await,
        Commands::Time { expr } => print_time(&expr),
        cmd => {
            let store = SqliteStagingStore::open(&config.db_path)?;
            handle_command(cmd, &store)
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut builder = match &args.config {
        Some(path) => {
            let file = Config::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            ConfigBuilder::from_config(file)
        }
        None => Config::builder(),
    };

    if let Some(db) = &args.db {
        builder = builder.db_path(db);
    }
    if let Some(ms) = args.retry_period_ms {
        builder = builder.retry_period_ms(ms);
    }
    if let Some(limit) = args.submit_size_limit {
        builder = builder.submit_size_limit(limit);
    }
    if let Some(ms) = args.max_time_publishing_ms {
        builder = builder.max_time_publishing_ms(ms);
    }

    Ok(builder.build())
}

async fn run(config: Config, output: PathBuf) -> Result<()> {
    tracing::info!("HDDS Historian starting...");
    tracing::info!("  Database: {}", config.db_path.display());
    tracing::info!("  Output: {}", output.display());
    tracing::info!("  Retry period: {} ms", config.retry_period_ms);
    tracing::info!("  Batch size: {}", config.submit_size_limit);

    let service = HistorianService::open(config, JsonLinesSink::new(&output))?;

    // Plain thread: a pending stdin read must not hold up shutdown
    let producer = service.producer();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if producer.is_closed() {
                tracing::debug!("Publish loop stopped, no longer reading stdin");
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("stdin read failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RawMessage>(&line) {
                Ok(msg) => {
                    // Adapter errors are logged by the producer
                    let _ = producer.submit_raw(&msg);
                }
                Err(e) => tracing::warn!("Skipping malformed input line: {}", e),
            }
        }
        tracing::debug!("stdin closed");
    });

    let stopped = service
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Ctrl-C handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = stopped.stats();
    tracing::info!(
        "Published {} entries in {} batches ({} sink failures, {} still outstanding)",
        stats.entries_confirmed,
        stats.batches_published,
        stats.sink_failures,
        stopped.store().outstanding_count()?
    );

    Ok(())
}

fn handle_command(cmd: Commands, store: &SqliteStagingStore) -> Result<()> {
    match cmd {
        Commands::Pending { limit } => {
            let entries = store.oldest(limit)?;
            println!("Oldest {} outstanding entries:", entries.len());
            for entry in &entries {
                println!(
                    "  id={}, ts={}, source={}, topic={}, value={}",
                    entry.id,
                    entry.timestamp.to_rfc3339(),
                    entry.source,
                    entry.topic,
                    entry.value
                );
            }
        }
        Commands::Stats => {
            println!("Outstanding entries: {}", store.outstanding_count()?);
            println!("Known topics: {}", store.topics().len());
        }
        Commands::Topics => {
            println!("Known topics:");
            for (id, name) in store.topics() {
                println!("  {} ({})", name, id);
            }
        }
        Commands::Run | Commands::Time { .. } => {}
    }

    Ok(())
}

fn print_time(expr: &str) -> Result<()> {
    match parse_time_query(expr)? {
        TimeBound::Instant(t) => println!("{}", t.to_rfc3339()),
        TimeBound::Range(start, end) => println!("{} .. {}", start.to_rfc3339(), end.to_rfc3339()),
    }
    Ok(())
}
