// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingress adapters and the producer handle
//!
//! Raw bus messages (device scrapes, log requests, actuator writes) are
//! normalized into [`ReadingRecord`]s and handed to the ingestion queue
//! through a [`Producer`]. Malformed input is logged, counted and dropped;
//! nothing here ever blocks.

use crate::queue::{QueueError, QueueSender};
use crate::store::{ReadingRecord, Source};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Topic prefix of actuator value messages
pub const ACTUATOR_VALUE_PREFIX: &str = "actuators/value";

/// Header carrying the scrape timestamp
pub const DATE_HEADER: &str = "Date";

/// Header carrying the actuator timestamp
pub const TIME_HEADER: &str = "time";

/// A message as delivered by the ingress transport
///
/// Frames hold JSON text, one document per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub source: Source,
    pub topic: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub frames: Vec<String>,
}

impl RawMessage {
    pub fn new(source: Source, topic: impl Into<String>) -> Self {
        Self {
            source,
            topic: topic.into(),
            headers: BTreeMap::new(),
            frames: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frames.push(frame.into());
        self
    }

    /// Header lookup, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn frame(&self, index: usize) -> Result<Value, IngestError> {
        let text = self
            .frames
            .get(index)
            .ok_or(IngestError::MissingFrame(index))?;
        serde_json::from_str(text).map_err(|e| IngestError::BadFrame {
            index,
            reason: e.to_string(),
        })
    }
}

/// Adapter errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IngestError {
    #[error("Missing '{0}' header")]
    MissingHeader(&'static str),

    #[error("Bad timestamp string: {0}")]
    BadTimestamp(String),

    #[error("Missing message frame {0}")]
    MissingFrame(usize),

    #[error("Bad message frame {index}: {reason}")]
    BadFrame { index: usize, reason: String },

    #[error("Frame {0} is not a JSON object")]
    NotAnObject(usize),

    #[error("Invalid topic: '{0}'")]
    InvalidTopic(String),
}

/// Submission errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubmitError {
    #[error("Record has an empty topic")]
    EmptyTopic,

    #[error("Record for {0} has no readings")]
    NoReadings(String),

    #[error("Record for {topic} has an unrepresentable timestamp {timestamp}")]
    TimestampOutOfRange {
        topic: String,
        timestamp: DateTime<Utc>,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Collapse repeated and surrounding slashes and whitespace
///
/// `" /campus//building/ temp/ "` becomes `"campus/building/temp"`.
pub fn normalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parse a header timestamp
///
/// Accepts RFC 3339 (converted to UTC) and naive
/// `YYYY-MM-DD[T ]HH:MM:SS[.f]` (taken as UTC).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, IngestError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt.and_utc());
        }
    }
    Err(IngestError::BadTimestamp(s.to_string()))
}

/// Normalize a message according to its source
pub fn to_records(msg: &RawMessage) -> Result<Vec<ReadingRecord>, IngestError> {
    match msg.source {
        Source::Scrape => scrape_records(msg),
        Source::Log => log_records(msg, Utc::now()),
        Source::Actuator => actuator_records(msg).map(|r| vec![r]),
    }
}

/// Device scrape: one record per point, all stamped with the `Date` header
pub fn scrape_records(msg: &RawMessage) -> Result<Vec<ReadingRecord>, IngestError> {
    let date = msg
        .header(DATE_HEADER)
        .ok_or(IngestError::MissingHeader(DATE_HEADER))?;
    let timestamp = parse_timestamp(date)?;
    let device = checked_topic(&msg.topic)?;

    let values = match msg.frame(0)? {
        Value::Object(values) => values,
        _ => return Err(IngestError::NotAnObject(0)),
    };

    let mut meta = match msg.frame(1) {
        Ok(Value::Object(meta)) => meta,
        Ok(_) => {
            tracing::warn!("Metadata for {} is not an object", device);
            Default::default()
        }
        Err(e) => {
            tracing::warn!("Metadata for {}: {}", device, e);
            Default::default()
        }
    };

    let records = values
        .into_iter()
        .map(|(point, value)| {
            let mut record = ReadingRecord::new(Source::Scrape, format!("{}/{}", device, point))
                .with_reading(timestamp, value);
            if let Some(Value::Object(point_meta)) = meta.remove(&point) {
                record.meta = point_meta
                    .into_iter()
                    .map(|(name, value)| (name, meta_string(value)))
                    .collect();
            }
            record
        })
        .collect();

    Ok(records)
}

/// Log request: frame 0 maps points to `{Readings, Units, data_type?}`
///
/// Points missing `Readings` or `Units`, or with malformed readings, are
/// skipped. A scalar `Readings` is a single reading stamped `now`.
pub fn log_records(msg: &RawMessage, now: DateTime<Utc>) -> Result<Vec<ReadingRecord>, IngestError> {
    let base = checked_topic(&msg.topic)?;
    let points = match msg.frame(0)? {
        Value::Object(points) => points,
        _ => return Err(IngestError::NotAnObject(0)),
    };

    let mut records = Vec::with_capacity(points.len());
    for (point, item) in points {
        let path = format!("{}/{}", base, point);
        let (Some(readings), Some(units)) = (item.get("Readings"), item.get("Units")) else {
            tracing::error!("Logging request for {} missing Readings or Units", path);
            continue;
        };

        let dtype = match item.get("data_type").and_then(Value::as_str) {
            None | Some("double") => "float",
            Some(other) => other,
        };

        let readings = match readings {
            Value::Array(entries) => match log_readings(entries) {
                Ok(readings) => readings,
                Err(e) => {
                    tracing::error!("Logging request for {} has bad readings: {}", path, e);
                    continue;
                }
            },
            scalar => vec![(now, scalar.clone())],
        };

        let mut record = ReadingRecord::new(Source::Log, path)
            .with_meta("units", meta_string(units.clone()))
            .with_meta("type", dtype);
        record.readings = readings;
        records.push(record);
    }

    Ok(records)
}

fn log_readings(entries: &[Value]) -> Result<Vec<(DateTime<Utc>, Value)>, IngestError> {
    entries
        .iter()
        .map(|entry| match entry.as_array().map(Vec::as_slice) {
            Some([Value::String(ts), value]) => Ok((parse_timestamp(ts)?, value.clone())),
            _ => Err(IngestError::BadTimestamp(entry.to_string())),
        })
        .collect()
}

/// Actuator write: `time` header, prefix stripped, frame 0 is the value
pub fn actuator_records(msg: &RawMessage) -> Result<ReadingRecord, IngestError> {
    let time = msg
        .header(TIME_HEADER)
        .ok_or(IngestError::MissingHeader(TIME_HEADER))?;
    let timestamp = parse_timestamp(time)?;

    let full = normalize_topic(&msg.topic);
    let topic = match full.strip_prefix(ACTUATOR_VALUE_PREFIX) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => full.as_str(),
    };
    let topic = checked_topic(topic)?;

    let value = msg.frame(0)?;
    Ok(ReadingRecord::new(Source::Actuator, topic).with_reading(timestamp, value))
}

fn checked_topic(topic: &str) -> Result<String, IngestError> {
    let normalized = normalize_topic(topic);
    if normalized.is_empty() {
        Err(IngestError::InvalidTopic(topic.to_string()))
    } else {
        Ok(normalized)
    }
}

fn meta_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Producer counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProducerStats {
    /// Records enqueued
    pub accepted: u64,
    /// Records rejected by validation
    pub rejected: u64,
    /// Raw messages an adapter could not normalize
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
}

/// Cloneable submission handle for ingress adapters
#[derive(Debug, Clone)]
pub struct Producer {
    queue: QueueSender,
    counters: Arc<Counters>,
}

impl Producer {
    pub fn new(queue: QueueSender) -> Self {
        Self {
            queue,
            counters: Arc::new(Counters::default()),
        }
    }

    /// True once the publish loop has stopped accepting records
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Validate and enqueue a record
    ///
    /// The topic is normalized first. Rejected records are logged and
    /// dropped.
    pub fn submit(&self, mut record: ReadingRecord) -> Result<(), SubmitError> {
        record.topic = normalize_topic(&record.topic);

        let verdict = if record.topic.is_empty() {
            Err(SubmitError::EmptyTopic)
        } else if record.readings.is_empty() {
            Err(SubmitError::NoReadings(record.topic.clone()))
        } else if let Some((timestamp, _)) = record
            .readings
            .iter()
            .find(|(t, _)| t.timestamp_nanos_opt().is_none())
        {
            // Staging keys are nanosecond integers (years 1677 to 2262)
            Err(SubmitError::TimestampOutOfRange {
                topic: record.topic.clone(),
                timestamp: *timestamp,
            })
        } else {
            tracing::trace!("Queuing {} from {} for publish", record.topic, record.source);
            self.queue.put(record).map_err(SubmitError::from)
        };

        match &verdict {
            Ok(()) => self.counters.accepted.fetch_add(1, Ordering::Relaxed),
            Err(e) => {
                tracing::error!("Dropping record: {}", e);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed)
            }
        };
        verdict
    }

    /// Normalize a raw message and submit every resulting record
    ///
    /// Returns the number of records accepted.
    pub fn submit_raw(&self, msg: &RawMessage) -> Result<usize, IngestError> {
        let records = to_records(msg).map_err(|e| {
            tracing::error!("Message for {} from {} dropped: {}", msg.topic, msg.source, e);
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        tracing::debug!("Normalized {} into {} record(s)", msg.topic, records.len());
        Ok(records
            .into_iter()
            .filter(|record| self.submit(record.clone()).is_ok())
            .count())
    }

    /// Snapshot of the counters shared by all clones
    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ingestion_queue;
    use chrono::TimeZone;
    use serde_json::json;

    fn scrape(frames: &[&str]) -> RawMessage {
        let mut msg = RawMessage::new(Source::Scrape, "devices/campus/building/rtu1")
            .with_header("Date", "2024-02-01T10:00:00+01:00");
        for frame in frames {
            msg = msg.with_frame(*frame);
        }
        msg
    }

    #[test]
    fn test_normalize_topic() {
        assert_eq!(normalize_topic(" /campus//building/ temp/ "), "campus/building/temp");
        assert_eq!(normalize_topic("a/b"), "a/b");
        assert_eq!(normalize_topic("//"), "");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-02-01T10:00:00+01:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-02-01T09:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-02-01 09:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-02-01T09:00:00.000").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-02-01 11:00:00+02:00").unwrap(), expected);
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(IngestError::BadTimestamp(_))
        ));
    }

    #[test]
    fn test_scrape_splits_points_and_meta() {
        let msg = scrape(&[
            r#"{"temp": 21.5, "fan": true}"#,
            r#"{"temp": {"units": "degC", "tz": "UTC", "precision": 2}}"#,
        ]);
        let records = scrape_records(&msg).unwrap();
        assert_eq!(records.len(), 2);

        let temp = records
            .iter()
            .find(|r| r.topic == "devices/campus/building/rtu1/temp")
            .unwrap();
        assert_eq!(temp.source, Source::Scrape);
        assert_eq!(
            temp.readings,
            vec![(Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap(), json!(21.5))]
        );
        assert_eq!(temp.meta["units"], "degC");
        assert_eq!(temp.meta["precision"], "2");

        let fan = records.iter().find(|r| r.topic.ends_with("/fan")).unwrap();
        assert!(fan.meta.is_empty());
    }

    #[test]
    fn test_scrape_tolerates_missing_or_bad_meta() {
        assert_eq!(scrape_records(&scrape(&[r#"{"a": 1}"#])).unwrap().len(), 1);
        assert_eq!(
            scrape_records(&scrape(&[r#"{"a": 1}"#, "not json"])).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_scrape_rejects_bad_input() {
        let no_date = RawMessage::new(Source::Scrape, "dev").with_frame("{}");
        assert_eq!(
            scrape_records(&no_date),
            Err(IngestError::MissingHeader(DATE_HEADER))
        );

        let bad_date = no_date.clone().with_header("date", "noon");
        assert!(matches!(
            scrape_records(&bad_date),
            Err(IngestError::BadTimestamp(_))
        ));

        assert_eq!(scrape_records(&scrape(&[])), Err(IngestError::MissingFrame(0)));
        assert!(matches!(
            scrape_records(&scrape(&["{oops"])),
            Err(IngestError::BadFrame { index: 0, .. })
        ));
        assert_eq!(scrape_records(&scrape(&["[1, 2]"])), Err(IngestError::NotAnObject(0)));
    }

    #[test]
    fn test_log_records() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let frame = json!({
            "power": {"Readings": 42, "Units": "kW"},
            "energy": {
                "Readings": [["2024-05-31T23:00:00", 1.0], ["2024-05-31T23:30:00Z", 2.0]],
                "Units": "kWh",
                "data_type": "double"
            },
            "mode": {"Readings": "auto", "Units": "", "data_type": "string"},
            "broken": {"Readings": 1},
            "garbled": {"Readings": [[1, 2]], "Units": "x"}
        });
        let msg = RawMessage::new(Source::Log, "datalogger/site").with_frame(frame.to_string());

        let records = log_records(&msg, now).unwrap();
        assert_eq!(records.len(), 3);

        let power = records.iter().find(|r| r.topic == "datalogger/site/power").unwrap();
        assert_eq!(power.readings, vec![(now, json!(42))]);
        assert_eq!(power.meta["units"], "kW");
        assert_eq!(power.meta["type"], "float");

        let energy = records.iter().find(|r| r.topic.ends_with("/energy")).unwrap();
        assert_eq!(energy.readings.len(), 2);
        assert_eq!(energy.meta["type"], "float");
        assert_eq!(
            energy.readings[1].0,
            Utc.with_ymd_and_hms(2024, 5, 31, 23, 30, 0).unwrap()
        );

        let mode = records.iter().find(|r| r.topic.ends_with("/mode")).unwrap();
        assert_eq!(mode.meta["type"], "string");
    }

    #[test]
    fn test_actuator_strips_prefix() {
        let msg = RawMessage::new(Source::Actuator, "actuators/value/campus/building/damper")
            .with_header("time", "2024-02-01T09:00:00Z")
            .with_frame("0.75");
        let record = actuator_records(&msg).unwrap();
        assert_eq!(record.topic, "campus/building/damper");
        assert_eq!(record.readings[0].1, json!(0.75));

        let no_time = RawMessage::new(Source::Actuator, "actuators/value/x").with_frame("1");
        assert_eq!(
            actuator_records(&no_time),
            Err(IngestError::MissingHeader(TIME_HEADER))
        );

        let bare = RawMessage::new(Source::Actuator, "actuators/value/")
            .with_header("time", "2024-02-01T09:00:00Z")
            .with_frame("1");
        assert!(matches!(actuator_records(&bare), Err(IngestError::InvalidTopic(_))));
    }

    #[test]
    fn test_producer_validates_and_counts() {
        let (tx, mut rx) = ingestion_queue();
        let producer = Producer::new(tx);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        producer
            .submit(ReadingRecord::new(Source::Log, "/a//b/").with_reading(ts, json!(1)))
            .unwrap();
        assert_eq!(
            producer.submit(ReadingRecord::new(Source::Log, " / ").with_reading(ts, json!(1))),
            Err(SubmitError::EmptyTopic)
        );
        assert_eq!(
            producer.submit(ReadingRecord::new(Source::Log, "a/b")),
            Err(SubmitError::NoReadings("a/b".to_string()))
        );

        let stats = producer.clone().stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 2);

        let queued = rx.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].topic, "a/b");
    }

    #[test]
    fn test_producer_rejects_unrepresentable_timestamp() {
        let (tx, mut rx) = ingestion_queue();
        let producer = Producer::new(tx);
        let far = Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap();
        let record = ReadingRecord::new(Source::Log, "a/b")
            .with_reading(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), json!(1))
            .with_reading(far, json!(2));

        assert_eq!(
            producer.submit(record),
            Err(SubmitError::TimestampOutOfRange {
                topic: "a/b".to_string(),
                timestamp: far,
            })
        );
        assert_eq!(producer.stats().rejected, 1);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_nanosecond_header_timestamp_is_kept() {
        let ts = parse_timestamp("2024-02-01T09:00:00.000000150Z").unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 150);
    }

    #[test]
    fn test_submit_raw() {
        let (tx, mut rx) = ingestion_queue();
        let producer = Producer::new(tx);

        let accepted = producer.submit_raw(&scrape(&[r#"{"a": 1, "b": 2}"#])).unwrap();
        assert_eq!(accepted, 2);
        assert_eq!(rx.drain().len(), 2);

        assert!(producer.submit_raw(&scrape(&["nope"])).is_err());
        assert_eq!(producer.stats().malformed, 1);
    }

    #[test]
    fn test_raw_message_from_json() {
        let msg: RawMessage = serde_json::from_str(
            r#"{"source":"actuator","topic":"actuators/value/x","headers":{"time":"2024-01-01T00:00:00Z"},"frames":["5"]}"#,
        )
        .unwrap();
        assert_eq!(msg.header("TIME"), Some("2024-01-01T00:00:00Z"));
        assert_eq!(to_records(&msg).unwrap()[0].topic, "x");
    }

    #[test]
    fn test_submit_after_consumer_gone() {
        let (tx, rx) = ingestion_queue();
        drop(rx);
        let producer = Producer::new(tx);
        assert!(producer.is_closed());
        let record = ReadingRecord::new(Source::Log, "a").with_reading(Utc::now(), json!(1));
        assert_eq!(
            producer.submit(record),
            Err(SubmitError::Queue(QueueError::Closed))
        );
    }
}
