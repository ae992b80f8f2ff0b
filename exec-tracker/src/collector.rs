use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aya::Ebpf;
use aya::maps::perf::AsyncPerfEventArrayBuffer;
use aya::maps::{AsyncPerfEventArray, MapData};
use aya::programs::TracePoint;
use aya::util::online_cpus;
use bytes::BytesMut;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityHistory;
use crate::buffer::{self, CollectorStats, Consumer, Producer, RawRecord, StatsSnapshot};
use crate::error::{AttachError, PollError};
use crate::event::{self, Event, MAX_SAMPLE_SIZE};
use crate::settings::CollectorSettings;

pub const PROGRAM_NAME: &str = "exec_tracker";
pub const MAP_NAME: &str = "EXEC_EVENTS";
pub const TRACEPOINT_CATEGORY: &str = "syscalls";
pub const TRACEPOINT_NAME: &str = "sys_enter_execve";

const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// A loaded and attached probe plus its perf readers.
///
/// `poll` and `close` both borrow the handle mutably, so a close can never
/// race an in-flight poll.
pub struct Handle {
    ebpf: Option<Ebpf>,
    readers: Vec<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    aborted: Vec<JoinHandle<()>>,
    consumer: Consumer,
    stats: Arc<CollectorStats>,
    activity: Arc<ActivityHistory>,
    batch_limit: usize,
    closed: bool,
}

/// Loads the embedded probe, attaches it to `syscalls:sys_enter_execve`
/// and starts one perf reader per online CPU.
///
/// Must be called from within a Tokio runtime.
pub fn attach(settings: &CollectorSettings) -> Result<Handle, AttachError> {
    // Object file built from `exec-tracker-ebpf` by build.rs.
    let bytecode = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/exec-tracker"));
    attach_bytecode(bytecode, settings)
}

pub fn attach_bytecode(bytecode: &[u8], settings: &CollectorSettings) -> Result<Handle, AttachError> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(AttachError::NoRuntime);
    }

    bump_memlock_rlimit();

    let mut ebpf = Ebpf::load(bytecode).map_err(AttachError::Load)?;
    attach_tracepoint(&mut ebpf)?;
    info!(
        "Tracepoint attached to {}:{}",
        TRACEPOINT_CATEGORY, TRACEPOINT_NAME
    );

    let mut perf_array = AsyncPerfEventArray::try_from(
        ebpf.take_map(MAP_NAME)
            .ok_or(AttachError::MapNotFound(MAP_NAME))?,
    )
    .map_err(AttachError::Map)?;

    let stats = Arc::new(CollectorStats::default());
    let (producer, consumer) = buffer::channel(settings.channel_capacity, stats.clone());

    let cpus = online_cpus().map_err(|(_, error)| AttachError::OnlineCpus(error))?;
    let mut readers = Vec::with_capacity(cpus.len());
    for cpu_id in cpus {
        let buf = match perf_array.open(cpu_id, Some(settings.perf_pages)) {
            Ok(buf) => buf,
            Err(source) => {
                readers.iter().for_each(JoinHandle::abort);
                return Err(AttachError::PerfBuffer { cpu: cpu_id, source });
            }
        };
        readers.push(tokio::task::spawn(read_cpu(
            cpu_id,
            buf,
            producer.clone(),
            settings.read_buffers,
        )));
    }
    info!("Perf readers started on {} CPUs", readers.len());

    let activity = Arc::new(ActivityHistory::new(
        settings.activity_interval(),
        settings.activity_slots,
    ));
    let ticker = activity.clone().spawn_ticker();

    Ok(Handle {
        ebpf: Some(ebpf),
        readers,
        ticker: Some(ticker),
        aborted: Vec::new(),
        consumer,
        stats,
        activity,
        batch_limit: settings.batch_limit,
        closed: false,
    })
}

impl Handle {
    /// Waits up to `timeout` for new records and decodes everything that is
    /// buffered. An empty batch means the timeout elapsed.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Batch, PollError> {
        if self.closed {
            return Err(PollError::Closed);
        }
        let records = self
            .consumer
            .recv_batch(timeout, self.batch_limit)
            .await
            .ok_or(PollError::Closed)?;

        let batch = Batch { records };
        let mut decoded = 0;
        for record in &batch.records {
            match event::decode(&record.bytes, record.cpu) {
                Ok(_) => decoded += 1,
                Err(e) => {
                    self.stats.record_decode_error();
                    warn!(cpu = record.cpu, error = %e, "Skipping malformed exec record");
                }
            }
        }
        self.activity.record(decoded);
        Ok(batch)
    }

    /// Stops the readers and unloads the probe, detaching the tracepoint.
    /// Calling it again has no effect.
    ///
    /// Reader tasks are aborted but not awaited; `join_readers` waits for
    /// them to finish.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in self.readers.drain(..).chain(self.ticker.take()) {
            task.abort();
            self.aborted.push(task);
        }
        self.consumer.close();
        if self.ebpf.take().is_some() {
            info!("Probe detached");
        }
    }

    pub async fn join_readers(&mut self) {
        for task in self.aborted.drain(..) {
            // a cancelled task resolves to a JoinError
            let _ = task.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn activity(&self) -> Arc<ActivityHistory> {
        self.activity.clone()
    }

    /// A handle with no kernel side, fed through `producer`.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize, batch_limit: usize) -> (Self, Producer) {
        let stats = Arc::new(CollectorStats::default());
        let (producer, consumer) = buffer::channel(capacity, stats.clone());
        let settings = CollectorSettings::default();
        let handle = Handle {
            ebpf: None,
            readers: Vec::new(),
            ticker: None,
            aborted: Vec::new(),
            consumer,
            stats,
            activity: Arc::new(ActivityHistory::new(
                settings.activity_interval(),
                settings.activity_slots,
            )),
            batch_limit,
            closed: false,
        };
        (handle, producer)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Records returned by one poll. Iterating decodes lazily and skips records
/// that fail to decode; `iter` may be called any number of times.
#[derive(Debug, Default)]
pub struct Batch {
    records: Vec<RawRecord>,
}

impl Batch {
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.records
            .iter()
            .filter_map(|record| event::decode(&record.bytes, record.cpu).ok())
    }

    pub fn raw_len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IntoIterator for Batch {
    type Item = Event;
    type IntoIter = std::iter::FilterMap<
        std::vec::IntoIter<RawRecord>,
        fn(RawRecord) -> Option<Event>,
    >;

    fn into_iter(self) -> Self::IntoIter {
        fn decode_record(record: RawRecord) -> Option<Event> {
            event::decode(&record.bytes, record.cpu).ok()
        }
        self.records
            .into_iter()
            .filter_map(decode_record as fn(RawRecord) -> Option<Event>)
    }
}

fn attach_tracepoint(ebpf: &mut Ebpf) -> Result<(), AttachError> {
    let roots = TRACEFS_MOUNT_POINTS.map(Path::new);
    match check_tracepoint(&roots, TRACEPOINT_CATEGORY, TRACEPOINT_NAME) {
        TracepointCheck::Present => {}
        TracepointCheck::Missing => {
            return Err(AttachError::TracepointMissing {
                category: TRACEPOINT_CATEGORY,
                name: TRACEPOINT_NAME,
            });
        }
        TracepointCheck::NoTracefs => {
            debug!("tracefs is not mounted, leaving the tracepoint check to the kernel")
        }
    }

    debug!("Loading program {}", PROGRAM_NAME);
    let program: &mut TracePoint = ebpf
        .program_mut(PROGRAM_NAME)
        .ok_or(AttachError::ProgramNotFound(PROGRAM_NAME))?
        .try_into()
        .map_err(AttachError::NotATracePoint)?;
    program.load().map_err(|source| AttachError::Program {
        stage: "load",
        source,
    })?;
    program
        .attach(TRACEPOINT_CATEGORY, TRACEPOINT_NAME)
        .map_err(|source| AttachError::Program {
            stage: "attach",
            source,
        })?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TracepointCheck {
    Present,
    Missing,
    /// No `events` directory under any root.
    NoTracefs,
}

fn check_tracepoint(roots: &[&Path], category: &str, name: &str) -> TracepointCheck {
    let mounted: Vec<PathBuf> = roots
        .iter()
        .map(|root| root.join("events"))
        .filter(|events| events.is_dir())
        .collect();
    if mounted.is_empty() {
        TracepointCheck::NoTracefs
    } else if mounted
        .iter()
        .any(|events| events.join(category).join(name).exists())
    {
        TracepointCheck::Present
    } else {
        TracepointCheck::Missing
    }
}

async fn read_cpu(
    cpu_id: u32,
    mut buf: AsyncPerfEventArrayBuffer<MapData>,
    producer: Producer,
    read_buffers: usize,
) {
    let mut buffers = (0..read_buffers.max(1))
        .map(|_| BytesMut::with_capacity(MAX_SAMPLE_SIZE))
        .collect::<Vec<_>>();

    loop {
        let events = match buf.read_events(&mut buffers).await {
            Ok(events) => events,
            Err(err) => {
                error!(cpu = cpu_id, "Error reading perf events: {}", err);
                return;
            }
        };
        if events.lost > 0 {
            producer.stats().record_dropped(events.lost as u64);
            debug!(cpu = cpu_id, lost = events.lost, "Perf buffer overflowed");
        }
        for slot in buffers.iter_mut().take(events.read) {
            let record = RawRecord {
                cpu: cpu_id,
                bytes: slot.split().freeze(),
            };
            if !producer.submit(record) {
                return;
            }
        }
    }
}

// Needed for kernels without memcg based accounting of BPF memory,
// see https://lwn.net/Articles/837122/
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("remove limit on locked memory failed, ret is: {ret}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn record(cpu: u32, bytes: &[u8]) -> RawRecord {
        RawRecord {
            cpu,
            bytes: Bytes::copy_from_slice(bytes),
        }
    }

    #[tokio::test]
    async fn test_poll_timeout_is_empty_not_error() {
        let (mut handle, _producer) = Handle::detached(8, 16);
        let batch = handle.poll(Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.iter().count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_hide_later_ones() {
        let (mut handle, producer) = Handle::detached(8, 16);
        producer.submit(record(0, &event::encode(10, "sh")));
        producer.submit(record(1, &[1, 2, 3]));
        producer.submit(record(0, &event::encode(11, "true")));

        let batch = handle.poll(Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.raw_len(), 3);
        let pids: Vec<u32> = batch.iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![10, 11]);
        assert_eq!(handle.stats_snapshot().decode_errors, 1);
    }

    #[tokio::test]
    async fn test_batch_is_restartable() {
        let (mut handle, producer) = Handle::detached(8, 16);
        producer.submit(record(2, &event::encode(7, "env")));

        let batch = handle.poll(Duration::from_millis(50)).await.unwrap();
        let first: Vec<Event> = batch.iter().collect();
        let second: Vec<Event> = batch.iter().collect();
        assert_eq!(first, second);
        assert_eq!(batch.into_iter().next().map(|e| e.cpu), Some(2));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut handle, producer) = Handle::detached(8, 16);
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(
            handle.poll(Duration::from_millis(10)).await.unwrap_err(),
            PollError::Closed
        );
        assert!(!producer.submit(record(0, &event::encode(1, "x"))));
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_join_readers_waits_for_aborted_tasks() {
        let (mut handle, _producer) = Handle::detached(8, 16);
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        let watch = task.abort_handle();
        handle.readers.push(task);

        handle.close();
        handle.join_readers().await;
        assert!(watch.is_finished());
        assert!(dropped.load(Ordering::SeqCst));

        // nothing left to wait for
        handle.join_readers().await;
    }

    #[tokio::test]
    async fn test_poll_counts_decoded_events_as_activity() {
        let (mut handle, producer) = Handle::detached(8, 16);
        producer.submit(record(0, &event::encode(10, "sh")));
        producer.submit(record(0, &[0u8; 3]));
        producer.submit(record(1, &event::encode(11, "ls")));

        handle.poll(Duration::from_millis(50)).await.unwrap();
        let activity = handle.activity();
        activity.tick();
        assert_eq!(activity.snapshot().history.last(), Some(&2));
    }

    fn tracefs_root(dir: &Path, tracepoints: &[(&str, &str)]) -> PathBuf {
        let events = dir.join("events");
        std::fs::create_dir_all(&events).unwrap();
        for (category, name) in tracepoints {
            std::fs::create_dir_all(events.join(category).join(name)).unwrap();
        }
        dir.to_path_buf()
    }

    #[test]
    fn test_tracepoint_present() {
        let dir = tempfile::tempdir().unwrap();
        let root = tracefs_root(dir.path(), &[("syscalls", "sys_enter_execve")]);
        assert_eq!(
            check_tracepoint(&[root.as_path()], "syscalls", "sys_enter_execve"),
            TracepointCheck::Present
        );
    }

    #[test]
    fn test_tracepoint_missing_from_mounted_tracefs() {
        let dir = tempfile::tempdir().unwrap();
        let root = tracefs_root(dir.path(), &[("syscalls", "sys_enter_openat")]);
        assert_eq!(
            check_tracepoint(&[root.as_path()], "syscalls", "sys_enter_execve"),
            TracepointCheck::Missing
        );
    }

    #[test]
    fn test_tracepoint_found_under_second_mount_point() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let a = tracefs_root(first.path(), &[]);
        let b = tracefs_root(second.path(), &[("syscalls", "sys_enter_execve")]);
        assert_eq!(
            check_tracepoint(&[a.as_path(), b.as_path()], "syscalls", "sys_enter_execve"),
            TracepointCheck::Present
        );
    }

    #[test]
    fn test_no_tracefs_when_events_dir_absent() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-mounted");
        assert_eq!(
            check_tracepoint(&[dir.path(), missing.as_path()], "syscalls", "sys_enter_execve"),
            TracepointCheck::NoTracefs
        );
        assert_eq!(
            check_tracepoint(&[], "syscalls", "sys_enter_execve"),
            TracepointCheck::NoTracefs
        );
    }

    #[tokio::test]
    async fn test_poll_reports_closed_when_readers_exit() {
        let (mut handle, producer) = Handle::detached(8, 16);
        drop(producer);
        assert_eq!(
            handle.poll(Duration::from_millis(10)).await.unwrap_err(),
            PollError::Closed
        );
    }

    #[test]
    fn test_attach_without_runtime_fails() {
        let err = attach_bytecode(&[], &CollectorSettings::default()).err();
        assert!(matches!(err, Some(AttachError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_attach_rejects_garbage_object() {
        let err = attach_bytecode(b"not an elf", &CollectorSettings::default()).err();
        assert!(matches!(err, Some(AttachError::Load(_))));
    }
}
