// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish sink abstraction
//!
//! A sink forwards staged entries to the backing data store and reports,
//! through a [`PublishReport`], which of them it has persisted.
//!
//! # Reporting contract
//!
//! During [`PublishSink::publish`] the sink calls [`PublishReport::published`]
//! for each persisted entry, or [`PublishReport::all_published`] once if it
//! can only vouch for the whole batch. Partial success is reported through
//! the report and an `Ok` return; an `Err` means nothing from this call
//! counts as persisted.

use crate::store::StagedEntry;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    /// The batch could not be delivered this time; retried later
    #[error("Publish failed: {0}")]
    Transient(String),

    /// The sink can no longer make progress at all
    #[error("Sink cannot proceed: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Transient(e.to_string())
    }
}

/// Confirmations collected from one sink call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    ids: BTreeSet<i64>,
    all: bool,
}

/// What the publish loop should remove after a sink call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmed {
    /// Nothing was persisted
    Nothing,
    /// These row ids were persisted
    Ids(BTreeSet<i64>),
    /// The whole batch was persisted, without per-row attribution
    All,
}

impl PublishReport {
    /// Confirm a single entry
    pub fn published(&mut self, entry: &StagedEntry) {
        self.ids.insert(entry.id);
    }

    /// Confirm a single entry by id
    pub fn published_id(&mut self, id: i64) {
        self.ids.insert(id);
    }

    /// Confirm the whole batch
    pub fn all_published(&mut self) {
        self.all = true;
    }

    /// True if nothing was confirmed
    pub fn is_empty(&self) -> bool {
        !self.all && self.ids.is_empty()
    }

    /// Take the confirmations, leaving the report empty
    pub fn take(&mut self) -> Confirmed {
        let all = std::mem::take(&mut self.all);
        let ids = std::mem::take(&mut self.ids);
        if all {
            Confirmed::All
        } else if ids.is_empty() {
            Confirmed::Nothing
        } else {
            Confirmed::Ids(ids)
        }
    }
}

/// Downstream destination for staged readings
///
/// Implementations may block on I/O; the publish loop never runs two calls
/// at once.
pub trait PublishSink {
    /// Forward `batch` (oldest first) and report what was persisted
    fn publish(&mut self, batch: &[StagedEntry], report: &mut PublishReport)
        -> Result<(), SinkError>;

    /// Optional setup run by the publish loop before its first cycle
    fn setup(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<K: PublishSink + ?Sized> PublishSink for Box<K> {
    fn publish(
        &mut self,
        batch: &[StagedEntry],
        report: &mut PublishReport,
    ) -> Result<(), SinkError> {
        (**self).publish(batch, report)
    }

    fn setup(&mut self) -> Result<(), SinkError> {
        (**self).setup()
    }
}

/// Appends each entry as one JSON line to a file
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Create a sink writing to `path` (opened on setup)
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, SinkError> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| {
                    SinkError::Fatal(format!("cannot open {}: {}", self.path.display(), e))
                })?;
            self.writer = Some(BufWriter::new(file));
        }
        self.writer
            .as_mut()
            .ok_or_else(|| SinkError::Fatal("sink writer unavailable".to_string()))
    }
}

impl PublishSink for JsonLinesSink {
    fn setup(&mut self) -> Result<(), SinkError> {
        self.writer().map(|_| ())
    }

    fn publish(
        &mut self,
        batch: &[StagedEntry],
        report: &mut PublishReport,
    ) -> Result<(), SinkError> {
        let writer = self.writer()?;
        let written = write_entries(writer, batch);

        if written.is_empty() && !batch.is_empty() {
            return Err(SinkError::Transient("no entries written".to_string()));
        }

        // Only what reached the file counts as published
        if let Err(e) = writer.flush() {
            self.writer = None;
            return Err(e.into());
        }
        for id in written {
            report.published_id(id);
        }

        Ok(())
    }
}

/// Write one JSON line per entry, stopping at the first failure
///
/// Returns the ids of the entries written before the failure.
fn write_entries<W: Write>(writer: &mut W, batch: &[StagedEntry]) -> Vec<i64> {
    let mut written = Vec::with_capacity(batch.len());

    for entry in batch {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(
                    "Cannot encode entry {}, sink stopped after {} entries: {}",
                    entry.id,
                    written.len(),
                    e
                );
                break;
            }
        };
        if let Err(e) = writeln!(writer, "{}", line) {
            tracing::warn!("Write to sink stopped after {} entries: {}", written.len(), e);
            break;
        }
        written.push(entry.id);
    }

    written
}
