// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// End-to-end publish pipeline: queue -> SQLite staging -> sink -> cleanup,
// against an on-disk database.

use chrono::{DateTime, TimeZone, Utc};
use hdds_historian::{
    ingestion_queue, Config, FlushOutcome, HistorianService, JsonLinesSink, PublishLoop,
    PublishReport, PublishSink, QueueSender, RawMessage, ReadingRecord, SinkError, Source,
    SqliteStagingStore, StagedEntry, StagingStore,
};
use serde_json::{json, Value};
use std::path::Path;

type SinkFn = Box<dyn FnMut(&[StagedEntry], &mut PublishReport) -> Result<(), SinkError>>;

/// Sink driven by a closure; remembers the values of every batch it saw
struct FnSink {
    handler: SinkFn,
    batches: Vec<Vec<Value>>,
}

impl FnSink {
    fn new(
        handler: impl FnMut(&[StagedEntry], &mut PublishReport) -> Result<(), SinkError> + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            batches: Vec::new(),
        }
    }
}

impl PublishSink for FnSink {
    fn publish(&mut self, batch: &[StagedEntry], report: &mut PublishReport) -> Result<(), SinkError> {
        self.batches
            .push(batch.iter().map(|e| e.value.clone()).collect());
        (self.handler)(batch, report)
    }
}

fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
}

fn reading(topic: &str, minute: u32, value: Value) -> ReadingRecord {
    ReadingRecord::new(Source::Scrape, topic).with_reading(ts(minute), value)
}

fn config(batch: usize) -> Config {
    Config::builder()
        .submit_size_limit(batch)
        .retry_period_ms(20)
        .build()
}

fn open_loop(
    path: &Path,
    batch: usize,
    sink: FnSink,
) -> (PublishLoop<SqliteStagingStore, FnSink>, QueueSender) {
    let store = SqliteStagingStore::open(path).unwrap();
    let (tx, rx) = ingestion_queue();
    (PublishLoop::new(config(batch), store, sink, rx), tx)
}

fn remaining_values(store: &SqliteStagingStore) -> Vec<Value> {
    store
        .oldest(100)
        .unwrap()
        .into_iter()
        .map(|e| e.value)
        .collect()
}

#[test]
fn test_partial_confirmation_keeps_unconfirmed_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut calls = 0;
    let sink = FnSink::new(move |batch, report| {
        calls += 1;
        if calls == 1 {
            // Confirm T1 and T3 only
            report.published(&batch[0]);
            report.published(&batch[2]);
        }
        Ok(())
    });
    let (mut publish_loop, tx) = open_loop(&dir.path().join("stage.db"), 10, sink);

    tx.put(reading("plant/temp", 2, json!("T2"))).unwrap();
    tx.put(reading("plant/temp", 3, json!("T3"))).unwrap();
    let outcome = publish_loop
        .cycle(Some(reading("plant/temp", 1, json!("T1"))))
        .unwrap();

    // Second call on the same pass confirms nothing
    assert_eq!(outcome, FlushOutcome::NoProgress);
    assert_eq!(remaining_values(publish_loop.store()), vec![json!("T2")]);
    assert_eq!(
        publish_loop.sink().batches,
        vec![
            vec![json!("T1"), json!("T2"), json!("T3")],
            vec![json!("T2")],
        ]
    );
    assert_eq!(publish_loop.stats().entries_confirmed, 2);
}

#[test]
fn test_confirm_all_removes_oldest_batch() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FnSink::new(|_, report| {
        report.all_published();
        Ok(())
    });
    let (mut publish_loop, tx) = open_loop(&dir.path().join("stage.db"), 2, sink);

    for minute in 2..=5 {
        tx.put(reading("plant/flow", minute, json!(minute))).unwrap();
    }
    let outcome = publish_loop
        .cycle(Some(reading("plant/flow", 1, json!(1))))
        .unwrap();

    assert_eq!(outcome, FlushOutcome::Drained);
    assert_eq!(publish_loop.store().outstanding_count().unwrap(), 0);
    assert_eq!(
        publish_loop.sink().batches,
        vec![
            vec![json!(1), json!(2)],
            vec![json!(3), json!(4)],
            vec![json!(5)],
        ]
    );
}

#[test]
fn test_sink_failure_is_retried_with_same_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut up = false;
    let sink = FnSink::new(move |batch, report| {
        if !up {
            up = true;
            // Anything reported before the error must not count
            report.all_published();
            return Err(SinkError::Transient("backend unreachable".to_string()));
        }
        for entry in batch {
            report.published(entry);
        }
        Ok(())
    });
    let (mut publish_loop, tx) = open_loop(&dir.path().join("stage.db"), 10, sink);

    tx.put(reading("plant/level", 2, json!(0.5))).unwrap();
    let first = publish_loop
        .cycle(Some(reading("plant/level", 1, json!(0.4))))
        .unwrap();
    assert_eq!(first, FlushOutcome::NoProgress);
    assert_eq!(publish_loop.store().outstanding_count().unwrap(), 2);
    assert_eq!(publish_loop.stats().sink_failures, 1);

    // Retry pass after the wait: no new input
    let second = publish_loop.cycle(None).unwrap();
    assert_eq!(second, FlushOutcome::Drained);
    assert_eq!(publish_loop.store().outstanding_count().unwrap(), 0);

    let batches = &publish_loop.sink().batches;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0], batches[1]);
}

#[test]
fn test_fatal_sink_error_stops_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FnSink::new(|_, _| Err(SinkError::Fatal("credentials revoked".to_string())));
    let (mut publish_loop, _tx) = open_loop(&dir.path().join("stage.db"), 10, sink);

    let err = publish_loop
        .cycle(Some(reading("plant/temp", 1, json!(1))))
        .unwrap_err();
    assert!(err.to_string().contains("credentials revoked"));
    assert_eq!(publish_loop.store().outstanding_count().unwrap(), 1);
}

#[test]
fn test_unconfirmed_rows_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stage.db");

    {
        let (mut publish_loop, tx) = open_loop(&path, 10, FnSink::new(|_, _| Ok(())));
        tx.put(reading("site/b", 2, json!(2))).unwrap();
        publish_loop
            .cycle(Some(
                reading("site/a", 1, json!(1)).with_meta("units", "kW"),
            ))
            .unwrap();
        assert_eq!(publish_loop.store().outstanding_count().unwrap(), 2);
    }

    let sink = FnSink::new(|batch, report| {
        for entry in batch {
            report.published(entry);
        }
        Ok(())
    });
    let (mut publish_loop, _tx) = open_loop(&path, 10, sink);

    let pending = publish_loop.store().oldest(10).unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].topic, "site/a");
    assert_eq!(pending[0].meta["units"], "kW");
    assert_eq!(
        publish_loop.store().topics(),
        vec![(1, "site/a".to_string()), (2, "site/b".to_string())]
    );

    assert_eq!(publish_loop.cycle(None).unwrap(), FlushOutcome::Drained);
    assert_eq!(publish_loop.store().outstanding_count().unwrap(), 0);
}

#[test]
fn test_duplicate_readings_collapse() {
    let dir = tempfile::tempdir().unwrap();
    let (mut publish_loop, tx) = open_loop(&dir.path().join("stage.db"), 10, FnSink::new(|_, _| Ok(())));

    tx.put(reading("plant/temp", 1, json!(21.0))).unwrap();
    tx.put(ReadingRecord::new(Source::Log, "plant/temp").with_reading(ts(1), json!(99)))
        .unwrap();
    publish_loop
        .cycle(Some(reading("plant/temp", 1, json!(20.0))))
        .unwrap();

    // Same (timestamp, topic, source) keeps the last value; other sources are distinct
    let entries = publish_loop.store().oldest(10).unwrap();
    assert_eq!(entries.len(), 2);
    let scrape = entries.iter().find(|e| e.source == Source::Scrape).unwrap();
    assert_eq!(scrape.value, json!(21.0));
}

#[tokio::test]
async fn test_service_relays_raw_messages_to_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("published.jsonl");
    let config = Config::builder()
        .db_path(dir.path().join("stage.db"))
        .retry_period_ms(20)
        .build();

    let service = HistorianService::open(config, JsonLinesSink::new(&output)).unwrap();
    let producer = service.producer();

    let scrape = RawMessage::new(Source::Scrape, "devices/campus/rtu1")
        .with_header("Date", "2024-03-01T12:00:00Z")
        .with_frame(r#"{"temp": 21.5, "fan": "on"}"#)
        .with_frame(r#"{"temp": {"units": "degC"}}"#);
    let actuator = RawMessage::new(Source::Actuator, "actuators/value/campus/rtu1/damper")
        .with_header("time", "2024-03-01T12:00:05Z")
        .with_frame("0.25");
    let broken = RawMessage::new(Source::Log, "datalogger/x").with_frame("not json");

    assert_eq!(producer.submit_raw(&scrape).unwrap(), 2);
    assert_eq!(producer.submit_raw(&actuator).unwrap(), 1);
    assert!(producer.submit_raw(&broken).is_err());
    assert_eq!(producer.stats().accepted, 3);
    assert_eq!(producer.stats().malformed, 1);
    drop(producer);

    let stopped = service.run().await.unwrap();
    assert_eq!(stopped.store().outstanding_count().unwrap(), 0);
    assert_eq!(stopped.stats().entries_confirmed, 3);

    let content = std::fs::read_to_string(&output).unwrap();
    let published: Vec<StagedEntry> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(published.len(), 3);

    let temp = published
        .iter()
        .find(|e| e.topic == "devices/campus/rtu1/temp")
        .unwrap();
    assert_eq!(temp.value, json!(21.5));
    assert_eq!(temp.meta["units"], "degC");
    assert!(published.iter().any(|e| e.topic == "campus/rtu1/damper"));
}
