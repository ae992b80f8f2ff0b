#![no_std]

/// Size of the kernel's `comm` field, terminator included.
pub const COMM_LEN: usize = 16;
/// Size of one record on the wire.
pub const EXEC_EVENT_SIZE: usize = 24;

/// Record written by the probe on every `execve` entry.
///
/// The layout is shared byte-for-byte with the collector; changing it
/// requires rebuilding both sides.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(bytemuck::Pod, bytemuck::Zeroable))]
pub struct ExecEvent {
    /// Thread-group id of the caller.
    pub pid: u32,
    pub _padding: [u8; 4],
    /// NUL-padded command name.
    pub comm: [u8; COMM_LEN],
}

const _: () = assert!(core::mem::size_of::<ExecEvent>() == EXEC_EVENT_SIZE);

impl ExecEvent {
    pub const fn new(pid: u32, comm: [u8; COMM_LEN]) -> Self {
        Self {
            pid,
            _padding: [0; 4],
            comm,
        }
    }

    /// Builds a record from an arbitrary name, truncating it to 15 bytes so
    /// the last byte is always a terminator.
    pub fn with_comm(pid: u32, name: &[u8]) -> Self {
        let mut comm = [0u8; COMM_LEN];
        let len = name.len().min(COMM_LEN - 1);
        comm[..len].copy_from_slice(&name[..len]);
        Self::new(pid, comm)
    }

    /// Command name up to the first NUL.
    pub fn comm_bytes(&self) -> &[u8] {
        let end = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMM_LEN);
        &self.comm[..end]
    }
}
