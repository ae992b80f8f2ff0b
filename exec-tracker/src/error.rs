use std::error::Error;
use std::fmt;
use std::io;

use aya::maps::MapError;
use aya::maps::perf::PerfBufferError;
use aya::programs::ProgramError;
use aya::EbpfError;

/// Startup failure while loading or attaching the probe.
#[derive(Debug)]
pub enum AttachError {
    /// `attach` was called outside a Tokio runtime.
    NoRuntime,
    /// The kernel refused the object file (maps, BTF relocations).
    Load(EbpfError),
    ProgramNotFound(&'static str),
    NotATracePoint(ProgramError),
    TracepointMissing {
        category: &'static str,
        name: &'static str,
    },
    /// Verifier rejection or missing privilege while loading or attaching.
    Program {
        stage: &'static str,
        source: ProgramError,
    },
    MapNotFound(&'static str),
    Map(MapError),
    OnlineCpus(io::Error),
    PerfBuffer { cpu: u32, source: PerfBufferError },
}

impl AttachError {
    /// True when the kernel answered EPERM or EACCES somewhere in the chain.
    pub fn is_permission_denied(&self) -> bool {
        let mut cur: Option<&(dyn Error + 'static)> = Some(self);
        while let Some(err) = cur {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if io_err.kind() == io::ErrorKind::PermissionDenied {
                    return true;
                }
            }
            cur = err.source();
        }
        false
    }

    /// True when the verifier refused the program and left a log. The
    /// kernel reports those with EACCES, which is not a privilege problem.
    pub fn is_verifier_rejection(&self) -> bool {
        match self {
            AttachError::Program {
                source: ProgramError::LoadError { verifier_log, .. },
                ..
            } => !verifier_log.to_string().trim().is_empty(),
            _ => false,
        }
    }

    fn needs_privilege_hint(&self) -> bool {
        !self.is_verifier_rejection() && self.is_permission_denied()
    }
}

const PRIVILEGE_HINT: &str = "run as root or grant CAP_BPF and CAP_PERFMON";

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::NoRuntime => write!(f, "attach must run inside a Tokio runtime"),
            AttachError::Load(e) => {
                write!(f, "kernel rejected the probe object: {}", e)?;
                if self.needs_privilege_hint() {
                    write!(f, " ({})", PRIVILEGE_HINT)?;
                }
                Ok(())
            }
            AttachError::ProgramNotFound(name) => {
                write!(f, "program {} not found in the probe object", name)
            }
            AttachError::NotATracePoint(e) => write!(f, "program is not a tracepoint: {}", e),
            AttachError::TracepointMissing { category, name } => write!(
                f,
                "tracepoint {}:{} does not exist on this kernel",
                category, name
            ),
            AttachError::Program { stage, source } => {
                if self.is_verifier_rejection() {
                    return write!(f, "verifier rejected the program at {}: {}", stage, source);
                }
                write!(f, "failed to {} program: {}", stage, source)?;
                if self.needs_privilege_hint() {
                    write!(f, " ({})", PRIVILEGE_HINT)?;
                }
                Ok(())
            }
            AttachError::MapNotFound(name) => write!(f, "map {} not found in the probe object", name),
            AttachError::Map(e) => write!(f, "failed to open perf event map: {}", e),
            AttachError::OnlineCpus(e) => write!(f, "failed to read online CPUs: {}", e),
            AttachError::PerfBuffer { cpu, source } => {
                write!(f, "failed to open perf buffer on CPU {}: {}", cpu, source)?;
                if self.needs_privilege_hint() {
                    write!(f, " ({})", PRIVILEGE_HINT)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for AttachError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AttachError::Load(e) => Some(e),
            AttachError::NotATracePoint(e) => Some(e),
            AttachError::Program { source, .. } => Some(source),
            AttachError::Map(e) => Some(e),
            AttachError::OnlineCpus(e) => Some(e),
            AttachError::PerfBuffer { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A raw record that does not have the size of an `ExecEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { len: usize },
    Oversized { len: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { len } => write!(
                f,
                "record of {} bytes is shorter than {}",
                len,
                exec_tracker_common::EXEC_EVENT_SIZE
            ),
            DecodeError::Oversized { len } => write!(
                f,
                "record of {} bytes is larger than a padded {}-byte sample",
                len,
                exec_tracker_common::EXEC_EVENT_SIZE
            ),
        }
    }
}

impl Error for DecodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollError {
    /// The handle was closed or every reader task has exited.
    Closed,
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Closed => write!(f, "collector is closed"),
        }
    }
}

impl Error for PollError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_detected_through_chain() {
        let err = AttachError::OnlineCpus(io::Error::from_raw_os_error(libc::EPERM));
        assert!(err.is_permission_denied());

        let err = AttachError::OnlineCpus(io::Error::from(io::ErrorKind::NotFound));
        assert!(!err.is_permission_denied());
    }

    fn load_error(errno: i32, log: &str) -> AttachError {
        AttachError::Program {
            stage: "load",
            source: ProgramError::LoadError {
                io_error: io::Error::from_raw_os_error(errno),
                verifier_log: aya_obj::VerifierLog::new(log.to_string()),
            },
        }
    }

    #[test]
    fn test_verifier_rejection_has_no_privilege_hint() {
        let err = load_error(libc::EACCES, "R1 invalid mem access 'scalar'");
        assert!(err.is_verifier_rejection());

        let msg = err.to_string();
        assert!(msg.starts_with("verifier rejected the program at load"), "{}", msg);
        assert!(!msg.contains("CAP_BPF"), "{}", msg);
        assert_eq!(msg.matches("invalid mem access").count(), 1, "{}", msg);
    }

    #[test]
    fn test_verifier_log_is_printed_once() {
        let msg = load_error(libc::EINVAL, "R1 invalid mem access 'scalar'").to_string();
        assert_eq!(msg.matches("invalid mem access").count(), 1, "{}", msg);
    }

    #[test]
    fn test_eperm_without_log_gets_privilege_hint() {
        let err = load_error(libc::EPERM, "");
        assert!(!err.is_verifier_rejection());
        let msg = err.to_string();
        assert!(msg.starts_with("failed to load program"), "{}", msg);
        assert!(msg.contains(PRIVILEGE_HINT), "{}", msg);
    }

    #[test]
    fn test_missing_tracepoint_names_it() {
        let err = AttachError::TracepointMissing {
            category: "syscalls",
            name: "sys_enter_execve",
        };
        assert_eq!(
            err.to_string(),
            "tracepoint syscalls:sys_enter_execve does not exist on this kernel"
        );
    }
}
