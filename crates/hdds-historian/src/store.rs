// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Staging store abstraction
//!
//! Defines the reading model and the trait for durable staging backends.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Per-point metadata (units, type, ...)
pub type Metadata = BTreeMap<String, String>;

/// Origin of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Periodic device scrape
    Scrape,
    /// Explicit log request
    Log,
    /// Actuator value write
    Actuator,
}

impl Source {
    /// Name stored in the `source` column
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Log => "log",
            Self::Actuator => "actuator",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(Self::Scrape),
            "log" => Ok(Self::Log),
            "actuator" => Ok(Self::Actuator),
            other => Err(format!("unknown reading source: {}", other)),
        }
    }
}

/// A batch of readings for one topic, as handed over by an ingress adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingRecord {
    /// Where the readings came from
    pub source: Source,

    /// Normalized slash-delimited topic path
    pub topic: String,

    /// (timestamp, value) samples
    pub readings: Vec<(DateTime<Utc>, serde_json::Value)>,

    /// Metadata merged into the (source, topic) cache
    #[serde(default)]
    pub meta: Metadata,
}

impl ReadingRecord {
    /// Create a record without readings or metadata
    pub fn new(source: Source, topic: impl Into<String>) -> Self {
        Self {
            source,
            topic: topic.into(),
            readings: Vec::new(),
            meta: Metadata::new(),
        }
    }

    /// Append a reading
    pub fn with_reading(mut self, timestamp: DateTime<Utc>, value: serde_json::Value) -> Self {
        self.readings.push((timestamp, value));
        self
    }

    /// Set a metadata entry
    pub fn with_meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(name.into(), value.into());
        self
    }
}

/// A reading waiting for confirmation, as read back from the store
///
/// Carries the resolved topic name and the current metadata for its
/// (source, topic) pair so sinks never need to touch the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedEntry {
    /// Row id assigned by the store
    pub id: i64,
    /// Reading timestamp
    pub timestamp: DateTime<Utc>,
    /// Reading origin
    pub source: Source,
    /// Interned topic id
    pub topic_id: i64,
    /// Topic name
    pub topic: String,
    /// Reading value
    pub value: serde_json::Value,
    /// Metadata snapshot for (source, topic_id)
    pub meta: Metadata,
}

/// Staging store trait
///
/// Crash-safe log of readings not yet confirmed by the publish sink.
/// Every mutating call is a single atomic unit.
///
/// # Implementations
///
/// - `SqliteStagingStore` -- Default
pub trait StagingStore {
    /// Persist every reading of every record, replacing rows that share
    /// (timestamp, topic, source). Returns the number of readings written.
    fn stage(&mut self, records: &[ReadingRecord]) -> Result<usize>;

    /// Oldest outstanding entries, ascending by timestamp, at most `limit`
    fn oldest(&self, limit: usize) -> Result<Vec<StagedEntry>>;

    /// Remove exactly the given rows
    fn delete(&mut self, ids: &BTreeSet<i64>) -> Result<usize>;

    /// Remove up to `limit` rows in ascending timestamp order
    fn delete_oldest(&mut self, limit: usize) -> Result<usize>;

    /// Number of outstanding rows
    fn outstanding_count(&self) -> Result<usize>;
}
