// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic and metadata interning
//!
//! Keeps the `topics` and `metadata` tables mirrored in memory so the hot
//! staging path never re-reads them. Writes go through an [`InternerDelta`]
//! that is only folded into the caches once the enclosing transaction has
//! committed; a rolled back transaction therefore leaves the caches as they
//! were.

use crate::store::{Metadata, Source};
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;

/// In-memory mirror of the topic and metadata tables
#[derive(Debug, Default)]
pub struct Interner {
    topic_ids: HashMap<String, i64>,
    topic_names: HashMap<i64, String>,
    metadata: HashMap<(Source, i64), Metadata>,
}

/// Cache updates made inside an uncommitted transaction
#[derive(Debug, Default)]
pub struct InternerDelta {
    topics: HashMap<String, i64>,
    metadata: HashMap<(Source, i64), Metadata>,
}

impl InternerDelta {
    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.metadata.is_empty()
    }
}

impl Interner {
    /// Load both caches from the database
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut interner = Self::default();

        let mut stmt = conn.prepare("SELECT topic_id, topic_name FROM topics")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (id, name) = row.context("Failed to read topics table")?;
            interner.topic_ids.insert(name.clone(), id);
            interner.topic_names.insert(id, name);
        }

        let mut stmt = conn.prepare("SELECT source, topic_id, name, value FROM metadata")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        for row in rows {
            let (source, topic_id, name, value) = row.context("Failed to read metadata table")?;
            let source: Source = source.parse().map_err(anyhow::Error::msg)?;
            interner
                .metadata
                .entry((source, topic_id))
                .or_default()
                .insert(name, value);
        }

        tracing::debug!(
            "Loaded {} topics and {} metadata groups",
            interner.topic_ids.len(),
            interner.metadata.len()
        );

        Ok(interner)
    }

    /// Look up a topic id, creating the durable entry on first sight
    ///
    /// New ids are recorded in `delta` and become visible to [`Self::topic_id`]
    /// after [`Self::apply`].
    pub fn resolve_or_create(
        &self,
        conn: &Connection,
        delta: &mut InternerDelta,
        topic: &str,
    ) -> Result<i64> {
        if let Some(id) = self.topic_ids.get(topic).or_else(|| delta.topics.get(topic)) {
            return Ok(*id);
        }

        conn.execute("INSERT INTO topics (topic_name) VALUES (?1)", [topic])
            .with_context(|| format!("Failed to intern topic {}", topic))?;
        let id = conn.last_insert_rowid();
        delta.topics.insert(topic.to_string(), id);

        tracing::debug!("Interned topic {} as {}", topic, id);
        Ok(id)
    }

    /// Upsert metadata entries for (source, topic_id)
    ///
    /// Keys absent from `meta` are left untouched.
    pub fn merge_metadata(
        &self,
        conn: &Connection,
        delta: &mut InternerDelta,
        source: Source,
        topic_id: i64,
        meta: &Metadata,
    ) -> Result<()> {
        if meta.is_empty() {
            return Ok(());
        }

        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO metadata (source, topic_id, name, value)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (name, value) in meta {
            stmt.execute(params![source.as_str(), topic_id, name, value])?;
        }

        delta
            .metadata
            .entry((source, topic_id))
            .or_default()
            .extend(meta.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(())
    }

    /// Fold committed changes into the caches
    pub fn apply(&mut self, delta: InternerDelta) {
        if delta.is_empty() {
            return;
        }
        tracing::trace!(
            "Caching {} new topics, {} metadata updates",
            delta.topics.len(),
            delta.metadata.len()
        );
        for (name, id) in delta.topics {
            self.topic_names.insert(id, name.clone());
            self.topic_ids.insert(name, id);
        }
        for (key, meta) in delta.metadata {
            self.metadata.entry(key).or_default().extend(meta);
        }
    }

    /// Id of a known topic
    pub fn topic_id(&self, topic: &str) -> Option<i64> {
        self.topic_ids.get(topic).copied()
    }

    /// Name of a known topic id
    pub fn topic_name(&self, topic_id: i64) -> Option<&str> {
        self.topic_names.get(&topic_id).map(String::as_str)
    }

    /// Cached metadata for (source, topic_id)
    pub fn metadata(&self, source: Source, topic_id: i64) -> Option<&Metadata> {
        self.metadata.get(&(source, topic_id))
    }

    /// All known topics as (id, name), ordered by id
    pub fn topics(&self) -> Vec<(i64, String)> {
        let mut topics: Vec<_> = self
            .topic_names
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        topics.sort_unstable_by_key(|(id, _)| *id);
        topics
    }

    /// Number of known topics
    pub fn topic_count(&self) -> usize {
        self.topic_ids.len()
    }
}
