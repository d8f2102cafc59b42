// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/retry loop
//!
//! Bridges the ingestion queue to the staging store and drives delivery to
//! the publish sink.
//!
//! # Operation
//!
//! 1. `Idle`: wait for input (up to the retry period) or pass straight
//!    through when backlog is known to be waiting
//! 2. `Draining`: pull everything queued and stage it in one transaction
//! 3. `Flushing`: publish the oldest outstanding batch, delete what the sink
//!    confirmed, repeat until the backlog is empty, the sink makes no
//!    progress, or the publishing time budget runs out

use crate::config::Config;
use crate::queue::{QueueError, QueueReceiver};
use crate::sink::{Confirmed, PublishReport, PublishSink, SinkError};
use crate::store::{ReadingRecord, StagingStore};
use anyhow::{Context, Result};
use std::future::Future;
use std::time::Instant;

/// Publish loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for input or the retry period
    Idle,
    /// Moving queued records into the store
    Draining,
    /// Handing staged batches to the sink
    Flushing,
}

/// How a flushing episode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No outstanding rows remain
    Drained,
    /// The sink confirmed nothing (or failed); wait before retrying
    NoProgress,
    /// Rows remain but the time budget ran out
    BudgetExhausted,
}

/// Publish loop statistics
#[derive(Debug, Default, Clone)]
pub struct PublishStats {
    /// Completed drain/flush cycles
    pub cycles: u64,
    /// Records pulled off the ingestion queue
    pub records_drained: u64,
    /// Readings written to the staging store
    pub readings_staged: u64,
    /// Sink invocations
    pub batches_published: u64,
    /// Staged rows removed after confirmation
    pub entries_confirmed: u64,
    /// Sink calls that returned an error
    pub sink_failures: u64,
    /// Flushing episodes that stopped for lack of progress
    pub no_progress_exits: u64,
    /// Flushing episodes cut short by the time budget
    pub budget_exhaustions: u64,
}

/// Publish/retry loop
///
/// Exclusively owns the staging store and the sink; staging, reading and
/// publishing never overlap.
pub struct PublishLoop<S: StagingStore, K: PublishSink> {
    config: Config,
    store: S,
    sink: K,
    queue: QueueReceiver,
    state: LoopState,
    wait_for_input: bool,
    stats: PublishStats,
}

impl<S: StagingStore, K: PublishSink> PublishLoop<S, K> {
    /// Create a new publish loop
    pub fn new(config: Config, store: S, sink: K, queue: QueueReceiver) -> Self {
        Self {
            config,
            store,
            sink,
            queue,
            state: LoopState::Idle,
            wait_for_input: true,
            stats: PublishStats::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Get loop statistics
    pub fn stats(&self) -> &PublishStats {
        &self.stats
    }

    /// Access the staging store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Access the sink
    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Tear down the loop, returning the store and the sink
    pub fn into_parts(self) -> (S, K) {
        (self.store, self.sink)
    }

    /// Run until every producer is gone
    pub async fn run(self) -> Result<Self> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves or every producer is gone
    ///
    /// A cycle in progress is always completed. Records still queued when
    /// the loop stops are staged before returning, so nothing accepted by
    /// the queue is lost.
    pub async fn run_until<F: Future>(mut self, shutdown: F) -> Result<Self> {
        tracing::info!(
            "PublishLoop started (retry period {:?}, batch size {}, publish budget {:?})",
            self.config.retry_period(),
            self.config.submit_size_limit,
            self.config.max_time_publishing()
        );

        self.sink.setup().context("Publish sink setup failed")?;
        // Nothing to retry means we can block for input straight away
        self.wait_for_input = self.store.outstanding_count()? == 0;

        tokio::pin!(shutdown);

        loop {
            let first = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("PublishLoop shutdown requested");
                    break;
                }
                first = self.queue.get(self.wait_for_input, self.config.retry_period()) => first,
            };

            let closed = matches!(first, Err(QueueError::Closed));
            self.cycle(first.ok())?;

            if closed {
                tracing::info!("All producers gone, PublishLoop stopping");
                break;
            }
        }

        let leftover = self.queue.drain();
        if !leftover.is_empty() {
            self.stats.records_drained += leftover.len() as u64;
            self.stats.readings_staged += self.store.stage(&leftover)? as u64;
            tracing::info!("Staged {} queued records before stopping", leftover.len());
        }

        tracing::info!(
            "PublishLoop stopped after {} cycles ({} confirmed, {} outstanding)",
            self.stats.cycles,
            self.stats.entries_confirmed,
            self.store.outstanding_count()?
        );
        Ok(self)
    }

    /// One Draining -> Flushing -> Idle pass
    ///
    /// `first` is the record that woke the loop, if any.
    pub fn cycle(&mut self, first: Option<ReadingRecord>) -> Result<FlushOutcome> {
        self.state = LoopState::Draining;
        let mut batch = Vec::new();
        if let Some(first) = first {
            batch.push(first);
            batch.extend(self.queue.drain());
        }
        self.stage(&batch)?;

        self.state = LoopState::Flushing;
        let outcome = self.flush();
        self.state = LoopState::Idle;
        let outcome = outcome?;

        // Only a blown time budget skips the wait; that backlog is retried now
        self.wait_for_input = outcome != FlushOutcome::BudgetExhausted;
        self.stats.cycles += 1;
        Ok(outcome)
    }

    fn stage(&mut self, batch: &[ReadingRecord]) -> Result<()> {
        if batch.is_empty() {
            tracing::trace!("Queue wait ended without input");
            return Ok(());
        }

        tracing::debug!("Staging {} queued records", batch.len());
        let staged = self
            .store
            .stage(batch)
            .context("Failed to stage queued records")?;
        self.stats.records_drained += batch.len() as u64;
        self.stats.readings_staged += staged as u64;
        Ok(())
    }

    /// Publish outstanding batches until drained, stuck, or out of time
    pub fn flush(&mut self) -> Result<FlushOutcome> {
        let started = Instant::now();
        let budget = self.config.max_time_publishing();
        let mut report = PublishReport::default();

        loop {
            let batch = self.store.oldest(self.config.submit_size_limit)?;
            if batch.is_empty() {
                return Ok(FlushOutcome::Drained);
            }

            tracing::debug!("Publishing batch of {} entries", batch.len());
            self.stats.batches_published += 1;

            match self.sink.publish(&batch, &mut report) {
                Ok(()) => {}
                Err(SinkError::Transient(reason)) => {
                    self.stats.sink_failures += 1;
                    tracing::warn!(
                        "Publish of {} entries failed, retrying later: {}",
                        batch.len(),
                        reason
                    );
                    if !report.is_empty() {
                        tracing::debug!("Discarding confirmations from the failed call");
                    }
                    report.take();
                }
                Err(fatal @ SinkError::Fatal(_)) => {
                    self.stats.sink_failures += 1;
                    tracing::error!("{}", fatal);
                    return Err(fatal.into());
                }
            }

            let removed = match report.take() {
                Confirmed::Nothing => {
                    self.stats.no_progress_exits += 1;
                    tracing::debug!("No entries confirmed, leaving flush");
                    return Ok(FlushOutcome::NoProgress);
                }
                Confirmed::Ids(ids) => self.store.delete(&ids)?,
                Confirmed::All => self.store.delete_oldest(self.config.submit_size_limit)?,
            };
            self.stats.entries_confirmed += removed as u64;
            tracing::trace!("Removed {} confirmed entries", removed);

            if started.elapsed() > budget {
                self.stats.budget_exhaustions += 1;
                tracing::debug!("Publish budget of {:?} exhausted", budget);
                return Ok(FlushOutcome::BudgetExhausted);
            }
        }
    }
}
