use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::activity::{ActivityHistory, ActivitySnapshot};
use crate::buffer::{CollectorStats, StatsSnapshot};
use crate::proctree::get_process_tree;
use crate::store::{ExecutionStorage, get_all_executions, get_executions_by_pid};

#[derive(Clone)]
pub struct AppState {
    pub storage: ExecutionStorage,
    pub stats: Arc<CollectorStats>,
    pub activity: Arc<ActivityHistory>,
}

/// Live view of a process from `/proc`.
#[derive(Debug, Serialize)]
pub struct ProcessDetails {
    pub pid: u32,
    pub ppid: i32,
    pub uid: u32,
    pub state: char,
    pub cmdline: Vec<String>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/executions", get(get_all_executions))
        .route("/executions/:pid", get(get_executions_by_pid))
        .route("/executions/:pid/details", get(get_process_details))
        .route("/stats", get(get_stats))
        .route("/activity", get(get_activity))
        .route("/processes/tree", get(get_process_tree))
        .with_state(state)
}

pub async fn start_http_server(listen: &str, state: AppState) -> anyhow::Result<JoinHandle<()>> {
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("HTTP server starting on http://{}", listener.local_addr()?);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    info!("API endpoints:");
    info!("  GET /executions - recent executions, oldest first");
    info!("  GET /executions/:pid - executions for specific PID");
    info!("  GET /executions/:pid/details - live /proc details for PID");
    info!("  GET /stats - collector counters");
    info!("  GET /activity - executions per slot and current rate");
    info!("  GET /processes/tree - live process tree from /proc");

    Ok(server_handle)
}

pub async fn get_stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

pub async fn get_activity(State(state): State<AppState>) -> Json<ActivitySnapshot> {
    Json(state.activity.snapshot())
}

pub async fn get_process_details(Path(pid): Path<u32>) -> Result<Json<ProcessDetails>, StatusCode> {
    read_process_details(pid).map(Json).ok_or_else(|| {
        info!("PID {} is no longer running", pid);
        StatusCode::NOT_FOUND
    })
}

fn read_process_details(pid: u32) -> Option<ProcessDetails> {
    let process = procfs::process::Process::new(i32::try_from(pid).ok()?).ok()?;
    let stat = process.stat().ok()?;
    Some(ProcessDetails {
        pid,
        ppid: stat.ppid,
        uid: process.uid().ok()?,
        state: stat.state,
        cmdline: process.cmdline().unwrap_or_default(),
    })
}
