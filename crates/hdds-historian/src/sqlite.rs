// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite staging backend
//!
//! Crash-safe staging of outstanding readings plus the topic and metadata
//! tables backing the [`Interner`].

use crate::interner::{Interner, InternerDelta};
use crate::store::{Metadata, ReadingRecord, Source, StagedEntry, StagingStore};
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use std::path::Path;

/// SQLite staging store
///
/// Owns its connection and the interner caches; meant to be driven by a
/// single publish loop.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE outstanding (
///     id INTEGER PRIMARY KEY,
///     ts INTEGER NOT NULL,            -- Unix nanoseconds, UTC
///     source TEXT NOT NULL,
///     topic_id INTEGER NOT NULL,
///     value_string TEXT NOT NULL,     -- canonical JSON
///     UNIQUE(ts, topic_id, source)
/// );
/// CREATE TABLE topics (
///     topic_id INTEGER PRIMARY KEY,
///     topic_name TEXT NOT NULL,
///     UNIQUE(topic_name)
/// );
/// CREATE TABLE metadata (
///     source TEXT NOT NULL,
///     topic_id INTEGER NOT NULL,
///     name TEXT NOT NULL,
///     value TEXT NOT NULL,
///     UNIQUE(topic_id, source, name)
/// );
/// ```
pub struct SqliteStagingStore {
    conn: Connection,
    interner: Interner,
}

impl SqliteStagingStore {
    /// Open (or create) a file-based staging database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .with_context(|| format!("{} is not a usable SQLite database", path.display()))?;

        let store = Self::from_connection(conn)?;
        tracing::info!(
            "Opened staging store {} ({} outstanding, {} topics)",
            path.display(),
            store.outstanding_count()?,
            store.interner.topic_count()
        );
        Ok(store)
    }

    /// Create an in-memory staging store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn).context("Failed to initialize staging schema")?;
        let interner = Interner::load(&conn)?;
        Ok(Self { conn, interner })
    }

    /// Resolve a topic id, creating it durably if unseen
    pub fn resolve_or_create(&mut self, topic: &str) -> Result<i64> {
        if let Some(id) = self.interner.topic_id(topic) {
            return Ok(id);
        }

        let tx = self.conn.transaction()?;
        let mut delta = InternerDelta::default();
        let id = self.interner.resolve_or_create(&tx, &mut delta, topic)?;
        tx.commit()?;
        self.interner.apply(delta);

        Ok(id)
    }

    /// Merge metadata for (source, topic_id), last write wins per key
    pub fn merge_metadata(&mut self, source: Source, topic_id: i64, meta: &Metadata) -> Result<()> {
        let tx = self.conn.transaction()?;
        let mut delta = InternerDelta::default();
        self.interner
            .merge_metadata(&tx, &mut delta, source, topic_id, meta)?;
        tx.commit()?;
        self.interner.apply(delta);

        Ok(())
    }

    /// Cached metadata for (source, topic_id)
    pub fn metadata(&self, source: Source, topic_id: i64) -> Metadata {
        self.interner
            .metadata(source, topic_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All interned topics as (id, name)
    pub fn topics(&self) -> Vec<(i64, String)> {
        self.interner.topics()
    }

    fn row_to_entry(&self, row: &rusqlite::Row) -> rusqlite::Result<StagedEntry> {
        let id: i64 = row.get(0)?;
        let ts_ns: i64 = row.get(1)?;
        let source_name: String = row.get(2)?;
        let topic_id: i64 = row.get(3)?;
        let value_string: String = row.get(4)?;

        let conversion = |e: Box<dyn std::error::Error + Send + Sync>| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e)
        };

        let timestamp = Utc.timestamp_nanos(ts_ns);
        let source: Source = source_name.parse().map_err(|e: String| conversion(e.into()))?;
        let value = serde_json::from_str(&value_string).map_err(|e| conversion(Box::new(e)))?;
        let topic = self
            .interner
            .topic_name(topic_id)
            .ok_or_else(|| conversion(format!("unknown topic id {}", topic_id).into()))?
            .to_string();

        Ok(StagedEntry {
            id,
            timestamp,
            source,
            topic_id,
            topic,
            value,
            meta: self.metadata(source, topic_id),
        })
    }
}

/// Create the staging tables if they do not exist yet
pub(crate) fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    // auto_vacuum only takes effect before the first table is created
    conn.execute_batch(
        "PRAGMA auto_vacuum = FULL;

         CREATE TABLE IF NOT EXISTS outstanding (
             id INTEGER PRIMARY KEY,
             ts INTEGER NOT NULL,
             source TEXT NOT NULL,
             topic_id INTEGER NOT NULL,
             value_string TEXT NOT NULL,
             UNIQUE(ts, topic_id, source)
         );

         CREATE INDEX IF NOT EXISTS idx_outstanding_ts ON outstanding(ts, id);

         CREATE TABLE IF NOT EXISTS topics (
             topic_id INTEGER PRIMARY KEY,
             topic_name TEXT NOT NULL,
             UNIQUE(topic_name)
         );

         CREATE TABLE IF NOT EXISTS metadata (
             source TEXT NOT NULL,
             topic_id INTEGER NOT NULL,
             name TEXT NOT NULL,
             value TEXT NOT NULL,
             UNIQUE(topic_id, source, name)
         );",
    )
}

impl StagingStore for SqliteStagingStore {
    fn stage(&mut self, records: &[ReadingRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut delta = InternerDelta::default();
        let mut written = 0;

        {
            let mut insert = tx.prepare_cached(
                "INSERT OR REPLACE INTO outstanding (ts, source, topic_id, value_string)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;

            for record in records {
                let topic_id = self
                    .interner
                    .resolve_or_create(&tx, &mut delta, &record.topic)?;
                self.interner.merge_metadata(
                    &tx,
                    &mut delta,
                    record.source,
                    topic_id,
                    &record.meta,
                )?;

                for (timestamp, value) in &record.readings {
                    let ts_ns = timestamp.timestamp_nanos_opt().with_context(|| {
                        format!("Timestamp {} for {} is out of range", timestamp, record.topic)
                    })?;
                    let value_string = serde_json::to_string(value)?;
                    insert.execute(params![
                        ts_ns,
                        record.source.as_str(),
                        topic_id,
                        value_string,
                    ])?;
                    written += 1;
                }
            }
        }

        tx.commit().context("Failed to commit staged readings")?;
        self.interner.apply(delta);

        tracing::debug!(
            "Staged {} readings from {} records",
            written,
            records.len()
        );
        Ok(written)
    }

    fn oldest(&self, limit: usize) -> Result<Vec<StagedEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, ts, source, topic_id, value_string
             FROM outstanding
             ORDER BY ts ASC, id ASC
             LIMIT ?1",
        )?;

        let limit = limit.min(i64::MAX as usize) as i64;
        let entries = stmt
            .query_map([limit], |row| self.row_to_entry(row))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read outstanding readings")?;

        Ok(entries)
    }

    fn delete(&mut self, ids: &BTreeSet<i64>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut del = tx.prepare_cached("DELETE FROM outstanding WHERE id = ?1")?;
            for id in ids {
                removed += del.execute([id])?;
            }
        }
        tx.commit().context("Failed to commit published deletions")?;

        tracing::trace!("Deleted {} of {} confirmed readings", removed, ids.len());
        Ok(removed)
    }

    fn delete_oldest(&mut self, limit: usize) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM outstanding
             WHERE id IN (
                 SELECT id FROM outstanding
                 ORDER BY ts ASC, id ASC
                 LIMIT ?1
             )",
            [limit.min(i64::MAX as usize) as i64],
        )?;
        tx.commit().context("Failed to commit published deletions")?;

        tracing::trace!("Deleted {} oldest readings", removed);
        Ok(removed)
    }

    fn outstanding_count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM outstanding", [], |row| row.get(0))?;

        Ok(count as usize)
    }
}
