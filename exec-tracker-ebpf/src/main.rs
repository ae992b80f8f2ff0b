#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid},
    macros::{map, tracepoint},
    maps::PerfEventArray,
    programs::TracePointContext,
};
use exec_tracker_common::{COMM_LEN, ExecEvent};

#[map]
static EXEC_EVENTS: PerfEventArray<ExecEvent> = PerfEventArray::new(0);

#[tracepoint]
pub fn exec_tracker(ctx: TracePointContext) -> u32 {
    try_exec_tracker(&ctx);
    0
}

// Runs on every execve entry. A full perf buffer drops the record.
fn try_exec_tracker(ctx: &TracePointContext) {
    // Upper half is the thread-group id.
    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let comm = bpf_get_current_comm().unwrap_or([0u8; COMM_LEN]);

    let event = ExecEvent::new(pid, comm);
    EXEC_EVENTS.output(ctx, &event, 0);
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual BSD/GPL\0";
