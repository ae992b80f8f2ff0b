use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::event::Event;
use crate::server::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessExecution {
    /// Insertion order, used to evict the right per-PID entry.
    pub seq: u64,
    pub pid: u32,
    pub comm: String,
    pub cpu: u32,
    pub timestamp: DateTime<Utc>, // receive time
}

// Thread-safe FIFO of recent executions with a per-PID index
#[derive(Clone)]
pub struct ExecutionStorage {
    executions: Arc<RwLock<VecDeque<ProcessExecution>>>,
    pid_executions: Arc<DashMap<u32, Vec<ProcessExecution>>>,
    next_seq: Arc<AtomicU64>,
    capacity: usize,
}

impl ExecutionStorage {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            executions: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            pid_executions: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    pub async fn add_event(&self, event: &Event, timestamp: DateTime<Utc>) {
        let execution = ProcessExecution {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            pid: event.pid,
            comm: event.comm.clone(),
            cpu: event.cpu,
            timestamp,
        };

        let mut executions = self.executions.write().await;

        if executions.len() >= self.capacity {
            if let Some(removed) = executions.pop_front() {
                if let Some(mut pid_vec) = self.pid_executions.get_mut(&removed.pid) {
                    pid_vec.retain(|e| e.seq != removed.seq);
                    if pid_vec.is_empty() {
                        drop(pid_vec);
                        self.pid_executions.remove(&removed.pid);
                    }
                }
            }
        }

        executions.push_back(execution.clone());

        self.pid_executions
            .entry(execution.pid)
            .or_default()
            .push(execution);
    }

    pub async fn get_all_executions(&self) -> Vec<ProcessExecution> {
        let executions = self.executions.read().await;
        executions.iter().cloned().collect()
    }

    pub fn get_executions_by_pid(&self, pid: u32) -> Vec<ProcessExecution> {
        self.pid_executions
            .get(&pid)
            .map(|executions| executions.clone())
            .unwrap_or_default()
    }

    pub fn tracked_pids(&self) -> usize {
        self.pid_executions.len()
    }
}

// HTTP API handlers
pub async fn get_all_executions(State(state): State<AppState>) -> Json<Vec<ProcessExecution>> {
    let executions = state.storage.get_all_executions().await;
    info!("Returning {} executions", executions.len());
    Json(executions)
}

pub async fn get_executions_by_pid(
    Path(pid): Path<u32>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ProcessExecution>>, StatusCode> {
    let executions = state.storage.get_executions_by_pid(pid);
    if executions.is_empty() {
        info!("No executions found for PID {}", pid);
        Err(StatusCode::NOT_FOUND)
    } else {
        info!("Returning {} executions for PID {}", executions.len(), pid);
        Ok(Json(executions))
    }
}
