// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingestion queue
//!
//! Unbounded FIFO handoff between any number of ingress producers and the
//! single publish loop. `put` never blocks; the consumer side offers a
//! bounded blocking pull and a non-blocking pull.

use crate::store::ReadingRecord;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Queue errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Nothing arrived before the wait ended
    #[error("Ingestion queue is empty")]
    Empty,

    /// The other side of the queue is gone
    #[error("Ingestion queue is closed")]
    Closed,
}

/// Create a connected sender/receiver pair
pub fn ingestion_queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Producer side, cheap to clone
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<ReadingRecord>,
}

impl QueueSender {
    /// Enqueue a record, waking the consumer if it is waiting
    pub fn put(&self, record: ReadingRecord) -> Result<(), QueueError> {
        self.tx.send(record).map_err(|_| QueueError::Closed)
    }

    /// True once the consumer has been dropped; every later `put` fails
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the publish loop
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<ReadingRecord>,
}

impl QueueReceiver {
    /// Pull one record
    ///
    /// With `block` set, waits up to `timeout` for a record to arrive;
    /// otherwise behaves like [`Self::get_nowait`].
    pub async fn get(&mut self, block: bool, timeout: Duration) -> Result<ReadingRecord, QueueError> {
        if !block {
            return self.get_nowait();
        }

        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Empty),
        }
    }

    /// Pull one record without waiting
    pub fn get_nowait(&mut self) -> Result<ReadingRecord, QueueError> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => QueueError::Empty,
            TryRecvError::Disconnected => QueueError::Closed,
        })
    }

    /// Pull everything currently queued
    pub fn drain(&mut self) -> Vec<ReadingRecord> {
        let mut records = Vec::new();
        while let Ok(record) = self.get_nowait() {
            records.push(record);
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Source;

    fn record(topic: &str) -> ReadingRecord {
        ReadingRecord::new(Source::Log, topic)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = ingestion_queue();
        for topic in ["a", "b", "c"] {
            tx.put(record(topic)).unwrap();
        }

        assert_eq!(rx.get(true, Duration::from_secs(1)).await.unwrap().topic, "a");
        assert_eq!(rx.get_nowait().unwrap().topic, "b");
        assert_eq!(rx.get(false, Duration::ZERO).await.unwrap().topic, "c");
        assert_eq!(rx.get_nowait(), Err(QueueError::Empty));
    }

    #[tokio::test]
    async fn test_get_times_out_when_empty() {
        let (_tx, mut rx) = ingestion_queue();
        let result = rx.get(true, Duration::from_millis(20)).await;
        assert_eq!(result.unwrap_err(), QueueError::Empty);
    }

    #[tokio::test]
    async fn test_put_wakes_waiting_consumer() {
        let (tx, mut rx) = ingestion_queue();

        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.put(record("late")).unwrap();
            tx
        });

        let got = rx.get(true, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.topic, "late");
        let _ = producer.await;
    }

    #[tokio::test]
    async fn test_closed_after_producers_dropped() {
        let (tx, mut rx) = ingestion_queue();
        let tx2 = tx.clone();
        tx.put(record("pending")).unwrap();
        drop(tx);
        drop(tx2);

        // Pending records are still delivered before the close is reported
        assert_eq!(rx.get_nowait().unwrap().topic, "pending");
        assert_eq!(rx.get_nowait(), Err(QueueError::Closed));
        assert_eq!(
            rx.get(true, Duration::from_secs(1)).await.unwrap_err(),
            QueueError::Closed
        );
    }

    #[test]
    fn test_put_fails_without_consumer() {
        let (tx, rx) = ingestion_queue();
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.put(record("x")), Err(QueueError::Closed));
    }

    #[test]
    fn test_concurrent_producers() {
        let (tx, mut rx) = ingestion_queue();
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        tx.put(record(&format!("{}/{}", n, i))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(rx.drain().len(), 100);
    }
}
