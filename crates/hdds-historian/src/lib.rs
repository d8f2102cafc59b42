// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Historian
//!
//! Durable relay between time-series producers and a backing data store.
//! Readings are accepted without blocking, staged in a local SQLite file and
//! published in bounded, retried batches; only rows the sink confirms are
//! ever removed.
//!
//! # Features
//!
//! - **Durable staging** -- SQLite store with interned topics and metadata
//! - **Partial confirmation** -- Sinks confirm per entry or per batch
//! - **Bounded publishing** -- Retry period and publish budget keep the loop
//!   responsive to new input
//! - **Time expressions** -- `now -1d`, `("1/1/2020", now)` for query bounds
//!
//! # Architecture
//!
//! ```text
//! HistorianService
//! +-- Producer            (ingress adapters -> ingestion queue)
//! +-- PublishLoop         (queue -> staging store -> sink)
//! |   +-- StagingStore    (SQLite, topic/metadata interner)
//! |   +-- PublishSink     (JSON lines file or custom backend)
//! +-- QueryHandler        (time-bounded queries on a HistorianBackend)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hdds_historian::{Config, HistorianService, JsonLinesSink};
//!
//! let config = Config::builder().db_path("historian_backup.db").build();
//! let service = HistorianService::open(config, JsonLinesSink::new("out.jsonl"))?;
//!
//! let producer = service.producer();
//! producer.submit_raw(&message)?;
//!
//! service.run_until(tokio::signal::ctrl_c()).await?;
//! ```

pub mod config;
pub mod ingest;
pub mod interner;
pub mod publisher;
pub mod query;
pub mod queue;
pub mod sink;
pub mod sqlite;
pub mod store;
pub mod timeexpr;

pub use config::{Config, ConfigBuilder, ConfigError};
pub use ingest::{IngestError, Producer, ProducerStats, RawMessage, SubmitError};
pub use interner::Interner;
pub use publisher::{FlushOutcome, LoopState, PublishLoop, PublishStats};
pub use query::{HistorianBackend, QueryError, QueryHandler, QueryRequest, QueryResult};
pub use queue::{ingestion_queue, QueueError, QueueReceiver, QueueSender};
pub use sink::{Confirmed, JsonLinesSink, PublishReport, PublishSink, SinkError};
pub use sqlite::SqliteStagingStore;
pub use store::{Metadata, ReadingRecord, Source, StagedEntry, StagingStore};
pub use timeexpr::{parse_time_query, TimeBound, TimeExpr, TimeExprError};

use anyhow::Result;
use std::future::Future;

/// Historian Service
///
/// Wires the ingestion queue, the staging store and the sink into one
/// publish loop and hands out producer handles.
///
/// # Type Parameters
///
/// - `S` -- Staging backend (e.g., `SqliteStagingStore`)
/// - `K` -- Publish sink
pub struct HistorianService<S: StagingStore, K: PublishSink> {
    producer: Producer,
    publish_loop: PublishLoop<S, K>,
}

impl<K: PublishSink> HistorianService<SqliteStagingStore, K> {
    /// Open the staging database named by `config.db_path`
    pub fn open(config: Config, sink: K) -> Result<Self> {
        let store = SqliteStagingStore::open(&config.db_path)?;
        Ok(Self::new(config, store, sink))
    }
}

impl<S: StagingStore, K: PublishSink> HistorianService<S, K> {
    /// Create a new historian service
    pub fn new(config: Config, store: S, sink: K) -> Self {
        let (tx, rx) = ingestion_queue();
        Self {
            producer: Producer::new(tx),
            publish_loop: PublishLoop::new(config, store, sink, rx),
        }
    }

    /// Get a producer handle for an ingress adapter
    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    /// Run until every producer handle is dropped
    pub async fn run(self) -> Result<PublishLoop<S, K>> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves or every producer handle is dropped
    ///
    /// Returns the stopped loop so its store, sink and statistics can be
    /// inspected.
    pub async fn run_until<F: Future>(self, shutdown: F) -> Result<PublishLoop<S, K>> {
        tracing::info!("Starting HDDS Historian");

        // Only handles given out through producer() keep the queue open
        let Self {
            producer,
            publish_loop,
        } = self;
        drop(producer);

        publish_loop.run_until(shutdown).await
    }
}
