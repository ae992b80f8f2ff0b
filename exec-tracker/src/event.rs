use exec_tracker_common::{EXEC_EVENT_SIZE, ExecEvent};

use crate::error::DecodeError;

/// The kernel stores a raw perf sample as a `u32` size followed by the
/// payload, rounded up to this alignment.
const PERF_SAMPLE_ALIGN: usize = 8;

/// Largest raw sample the kernel hands out for one `ExecEvent`.
pub const MAX_SAMPLE_SIZE: usize =
    (EXEC_EVENT_SIZE + 4).div_ceil(PERF_SAMPLE_ALIGN) * PERF_SAMPLE_ALIGN - 4;

/// A decoded exec event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub pid: u32,
    pub comm: String,
    /// CPU whose perf buffer carried the record.
    pub cpu: u32,
}

impl Event {
    pub fn from_raw(raw: &ExecEvent, cpu: u32) -> Self {
        Event {
            pid: raw.pid,
            comm: String::from_utf8_lossy(raw.comm_bytes()).into_owned(),
            cpu,
        }
    }
}

/// Decodes one raw sample. Trailing perf alignment padding is ignored.
pub fn decode(bytes: &[u8], cpu: u32) -> Result<Event, DecodeError> {
    let len = bytes.len();
    if len < EXEC_EVENT_SIZE {
        return Err(DecodeError::Truncated { len });
    }
    if len > MAX_SAMPLE_SIZE {
        return Err(DecodeError::Oversized { len });
    }
    let raw: ExecEvent = bytemuck::pod_read_unaligned(&bytes[..EXEC_EVENT_SIZE]);
    Ok(Event::from_raw(&raw, cpu))
}

/// Encodes a record the way the probe lays it out in the perf buffer.
pub fn encode(pid: u32, comm: &str) -> [u8; EXEC_EVENT_SIZE] {
    let raw = ExecEvent::with_comm(pid, comm.as_bytes());
    let mut out = [0u8; EXEC_EVENT_SIZE];
    out.copy_from_slice(bytemuck::bytes_of(&raw));
    out
}
