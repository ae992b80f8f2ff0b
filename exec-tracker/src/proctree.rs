use std::collections::{HashMap, HashSet};

use axum::{http::StatusCode, response::Json};
use serde::Serialize;
use tracing::{debug, error};

/// A process and its children, linked through `/proc/<pid>/stat` PPid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessNode {
    pub pid: i32,
    pub ppid: i32,
    pub comm: String,
    pub children: Vec<ProcessNode>,
}

/// Links `(pid, ppid, comm)` entries into trees. A process whose parent is
/// not in the list becomes a root. Siblings are sorted by pid and pid 0 is
/// left out.
pub fn build_tree(mut entries: Vec<(i32, i32, String)>) -> Vec<ProcessNode> {
    entries.retain(|(pid, _, _)| *pid != 0);
    let pids: HashSet<i32> = entries.iter().map(|(pid, _, _)| *pid).collect();
    let mut children: HashMap<i32, Vec<(i32, i32, String)>> = HashMap::new();
    let mut roots = Vec::new();
    for entry in entries {
        if pids.contains(&entry.1) {
            children.entry(entry.1).or_default().push(entry);
        } else {
            roots.push(entry);
        }
    }

    roots.sort_by_key(|(pid, _, _)| *pid);
    roots
        .into_iter()
        .map(|root| link(root, &mut children))
        .collect()
}

fn link(
    (pid, ppid, comm): (i32, i32, String),
    children: &mut HashMap<i32, Vec<(i32, i32, String)>>,
) -> ProcessNode {
    // taking the entry out means each process is linked exactly once
    let mut own = children.remove(&pid).unwrap_or_default();
    own.sort_by_key(|(pid, _, _)| *pid);
    ProcessNode {
        pid,
        ppid,
        comm,
        children: own.into_iter().map(|child| link(child, children)).collect(),
    }
}

/// Snapshot of every process visible in `/proc`. Processes that exit
/// during the scan are skipped.
pub fn read_process_tree() -> procfs::ProcResult<Vec<ProcessNode>> {
    let mut entries = Vec::new();
    for process in procfs::process::all_processes()? {
        let Ok(process) = process else { continue };
        match process.stat() {
            Ok(stat) => entries.push((stat.pid, stat.ppid, stat.comm)),
            Err(e) => debug!(pid = process.pid, "Skipping process: {}", e),
        }
    }
    Ok(build_tree(entries))
}

pub async fn get_process_tree() -> Result<Json<Vec<ProcessNode>>, StatusCode> {
    tokio::task::spawn_blocking(read_process_tree)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(Json)
        .map_err(|e| {
            error!("Failed to read /proc: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
