// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Historical query front-end
//!
//! Validates query arguments, resolves time bounds and delegates to the
//! storage backend.

use crate::ingest::normalize_topic;
use crate::store::Metadata;
use crate::timeexpr::{self, TimeBound, TimeExprError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Query errors
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("\"Topic\" required")]
    MissingTopic,

    #[error("Invalid {bound} time: {source}")]
    InvalidTime {
        bound: &'static str,
        #[source]
        source: TimeExprError,
    },

    #[error("Historian backend failed: {0:#}")]
    Backend(anyhow::Error),
}

/// Resolved query passed to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub topic: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub skip: usize,
    pub count: Option<usize>,
}

/// Query answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub values: Vec<(DateTime<Utc>, serde_json::Value)>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Storage backend capable of answering historical queries
pub trait HistorianBackend {
    fn query_historian(&self, request: &QueryRequest) -> anyhow::Result<QueryResult>;
}

impl<B: HistorianBackend + ?Sized> HistorianBackend for Box<B> {
    fn query_historian(&self, request: &QueryRequest) -> anyhow::Result<QueryResult> {
        (**self).query_historian(request)
    }
}

/// Query handler
pub struct QueryHandler<B> {
    backend: B,
}

impl<B: HistorianBackend> QueryHandler<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run a query
    ///
    /// `start` and `end` are RFC 3339 timestamps or time expressions that
    /// evaluate to a single instant.
    pub fn query(
        &self,
        topic: Option<&str>,
        start: Option<&str>,
        end: Option<&str>,
        skip: usize,
        count: Option<usize>,
    ) -> Result<QueryResult, QueryError> {
        let topic = topic.map(normalize_topic).unwrap_or_default();
        if topic.is_empty() {
            return Err(QueryError::MissingTopic);
        }

        let request = QueryRequest {
            topic,
            start: start.map(|s| parse_bound("start", s)).transpose()?,
            end: end.map(|s| parse_bound("end", s)).transpose()?,
            skip,
            count,
        };

        tracing::debug!(
            "Query {} start={:?} end={:?} skip={} count={:?}",
            request.topic,
            request.start,
            request.end,
            request.skip,
            request.count
        );

        self.backend
            .query_historian(&request)
            .map_err(QueryError::Backend)
    }
}

fn parse_bound(bound: &'static str, s: &str) -> Result<DateTime<Utc>, QueryError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
        return Ok(dt.with_timezone(&Utc));
    }

    let invalid = |source: TimeExprError| QueryError::InvalidTime { bound, source };
    match timeexpr::parse_time_query(s).map_err(invalid)? {
        TimeBound::Instant(t) => Ok(t),
        TimeBound::Range(..) => Err(invalid(TimeExprError::Syntax {
            expected: "a single time",
            found: "a time range".to_string(),
            offset: 0,
        })),
    }
}
