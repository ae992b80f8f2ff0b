//! Bounded hand-off between the per-CPU perf readers and the single
//! consumer behind `Handle::poll`.
//!
//! Producers never wait: a full buffer drops the record and bumps the drop
//! counter, the same way the kernel side treats a full perf buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// One raw perf sample and the CPU it came from.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub cpu: u32,
    pub bytes: Bytes,
}

/// Counters shared by the readers, the consumer and the HTTP API.
#[derive(Debug, Default)]
pub struct CollectorStats {
    received: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub decode_errors: u64,
}

impl CollectorStats {
    pub fn record_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct Producer {
    tx: mpsc::Sender<RawRecord>,
    stats: Arc<CollectorStats>,
}

pub struct Consumer {
    rx: mpsc::Receiver<RawRecord>,
}

pub fn channel(capacity: usize, stats: Arc<CollectorStats>) -> (Producer, Consumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Producer { tx, stats }, Consumer { rx })
}

impl Producer {
    /// Hands a record to the consumer, dropping it if the buffer is full.
    /// Returns false once the consumer is gone.
    pub fn submit(&self, record: RawRecord) -> bool {
        self.stats.record_received(1);
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.record_dropped(1);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }
}

impl Consumer {
    /// Waits up to `timeout` for a first record, then takes whatever else
    /// is already queued, up to `limit` records in total.
    ///
    /// Returns `None` when every producer is gone and the queue is empty.
    pub async fn recv_batch(&mut self, timeout: Duration, limit: usize) -> Option<Vec<RawRecord>> {
        let first = match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(_elapsed) => return Some(Vec::new()),
        };

        let mut batch = vec![first];
        while batch.len() < limit.max(1) {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Some(batch)
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}
