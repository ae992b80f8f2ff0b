//! Exec activity over a sliding window of fixed-length slots.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Counts decoded exec events per `interval` and keeps the last `slots`
/// counts, oldest first.
#[derive(Debug)]
pub struct ActivityHistory {
    interval: Duration,
    current: AtomicU64,
    slots: Mutex<VecDeque<u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivitySnapshot {
    pub interval_ms: u64,
    /// Executions per second in the last completed slot.
    pub rate_per_sec: u64,
    pub history: Vec<u64>,
}

impl ActivityHistory {
    pub fn new(interval: Duration, slots: usize) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        Self {
            interval,
            current: AtomicU64::new(0),
            slots: Mutex::new(VecDeque::from(vec![0; slots.max(1)])),
        }
    }

    pub fn record(&self, n: u64) {
        self.current.fetch_add(n, Ordering::Relaxed);
    }

    /// Closes the current slot and starts a new empty one.
    pub fn tick(&self) {
        let count = self.current.swap(0, Ordering::Relaxed);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.pop_front();
        slots.push_back(count);
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        let history: Vec<u64> = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        let interval_ms = self.interval.as_millis() as u64;
        let last = history.last().copied().unwrap_or(0);
        ActivitySnapshot {
            interval_ms,
            rate_per_sec: last * 1000 / interval_ms,
            history,
        }
    }

    /// Ticks every `interval` until the returned task is aborted.
    pub fn spawn_ticker(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.tick();
            }
        })
    }
}
