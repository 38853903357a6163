//! Process tracing plumbing
//!
//! Everything that talks to `ptrace(2)`, `tgkill(2)` and `waitpid(2)` lives
//! under this module. The tracer state machine only ever sees two traits:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  ThreadControl   per-thread stop / continue / detach             │
//! │        ▲                                                         │
//! │        │ supertrait                                              │
//! │  TraceBackend    attach, wait for events, resume with a signal   │
//! └──────────────────────────────────────────────────────────────────┘
//!          ▲
//!          │ implemented by
//!   Ptrace (live kernel)   ScriptedBackend (tests)
//! ```
//!
//! Failures are returned as `nix::Result` and the raw `trace()` call logs
//! them. Callers decide whether a failure matters: ESRCH on a thread that is
//! already gone is routine.

mod backend;
mod detach;
mod primitives;

use libc::c_int;
use nix::sys::ptrace::Options;
use nix::unistd::Pid;

pub use backend::Ptrace;
pub use detach::{detach_process, stop_and_detach};
pub use primitives::{signal_continue, signal_stop, trace, wait_until_stopped, Request};

/// One state change reported by `waitpid(-1, __WALL)`
///
/// Signal numbers are kept raw so real-time signals survive the round trip
/// back into `PTRACE_CONT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// SIGTRAP stop carrying a `PTRACE_EVENT_*` code
    PtraceEvent { pid: Pid, event: c_int },
    /// Signal-delivery stop (including the first stop of a new child)
    Stopped { pid: Pid, signal: c_int },
    /// Killed by a signal
    Signaled { pid: Pid, signal: c_int },
    /// Exited normally
    Exited { pid: Pid, code: c_int },
    /// Anything else waitpid might report
    Other { pid: Pid, status: c_int },
}

impl TraceEvent {
    /// Decode a raw wait status
    pub fn from_raw(pid: Pid, status: c_int) -> Self {
        if libc::WIFSTOPPED(status) {
            let signal = libc::WSTOPSIG(status);
            let event = (status >> 16) & 0xffff;
            if signal == libc::SIGTRAP && event != 0 {
                TraceEvent::PtraceEvent { pid, event }
            } else {
                TraceEvent::Stopped { pid, signal }
            }
        } else if libc::WIFSIGNALED(status) {
            TraceEvent::Signaled {
                pid,
                signal: libc::WTERMSIG(status),
            }
        } else if libc::WIFEXITED(status) {
            TraceEvent::Exited {
                pid,
                code: libc::WEXITSTATUS(status),
            }
        } else {
            TraceEvent::Other { pid, status }
        }
    }

    pub fn pid(&self) -> Pid {
        match *self {
            TraceEvent::PtraceEvent { pid, .. }
            | TraceEvent::Stopped { pid, .. }
            | TraceEvent::Signaled { pid, .. }
            | TraceEvent::Exited { pid, .. }
            | TraceEvent::Other { pid, .. } => pid,
        }
    }

    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match *self {
            TraceEvent::PtraceEvent { event, .. } => event_name(event),
            TraceEvent::Stopped { .. } => "stopped",
            TraceEvent::Signaled { .. } => "signaled",
            TraceEvent::Exited { .. } => "exited",
            TraceEvent::Other { .. } => "other",
        }
    }
}

/// Name of a `PTRACE_EVENT_*` code
pub fn event_name(event: c_int) -> &'static str {
    match event {
        libc::PTRACE_EVENT_FORK => "fork",
        libc::PTRACE_EVENT_VFORK => "vfork",
        libc::PTRACE_EVENT_CLONE => "clone",
        libc::PTRACE_EVENT_EXEC => "exec",
        libc::PTRACE_EVENT_VFORK_DONE => "vfork_done",
        libc::PTRACE_EVENT_EXIT => "exit",
        _ => "unknown",
    }
}

/// Thread-level operations needed to let go of a traced process
pub trait ThreadControl {
    /// PTRACE_SETOPTIONS; only succeeds while `tid` is in a ptrace stop
    fn set_options(&mut self, tid: Pid, options: Options) -> nix::Result<()>;

    /// PTRACE_DETACH without injecting a signal
    fn detach(&mut self, tid: Pid) -> nix::Result<()>;

    /// SIGSTOP to one thread of `tgid`
    fn signal_stop(&mut self, tgid: Pid, tid: Pid) -> nix::Result<()>;

    /// SIGCONT to one thread of `tgid`
    fn signal_continue(&mut self, tgid: Pid, tid: Pid) -> nix::Result<()>;

    /// Block (bounded) until `tid` reports a stop
    fn wait_until_stopped(&mut self, tid: Pid);

    /// Thread ids currently in `pid`'s thread group
    fn threads(&mut self, pid: Pid) -> Vec<Pid>;
}

/// Everything the fork/clone tracer needs from the kernel
pub trait TraceBackend: ThreadControl {
    /// PTRACE_ATTACH
    fn attach(&mut self, pid: Pid) -> nix::Result<()>;

    /// PTRACE_CONT, delivering `signal` (0 for none)
    fn cont(&mut self, pid: Pid, signal: c_int) -> nix::Result<()>;

    /// PTRACE_GETEVENTMSG: the new child of a fork/vfork/clone event
    fn event_message(&mut self, pid: Pid) -> nix::Result<Pid>;

    /// Block until any traced task changes state
    fn wait_any(&mut self) -> nix::Result<TraceEvent>;

    /// Plain SIGCONT to the whole process
    fn resume(&mut self, pid: Pid) -> nix::Result<()>;

    /// Detach every thread of `pid` and let it run
    fn detach_process(&mut self, pid: Pid) {
        detach_process(self, pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> Pid {
        Pid::from_raw(1234)
    }

    #[test]
    fn test_decode_ptrace_event() {
        let status = (libc::PTRACE_EVENT_CLONE << 16) | (libc::SIGTRAP << 8) | 0x7f;
        assert_eq!(
            TraceEvent::from_raw(pid(), status),
            TraceEvent::PtraceEvent {
                pid: pid(),
                event: libc::PTRACE_EVENT_CLONE
            }
        );
    }

    #[test]
    fn test_decode_plain_stops() {
        let stop = (libc::SIGSTOP << 8) | 0x7f;
        assert_eq!(
            TraceEvent::from_raw(pid(), stop),
            TraceEvent::Stopped {
                pid: pid(),
                signal: libc::SIGSTOP
            }
        );

        // SIGTRAP with no event bits is an ordinary signal stop
        let trap = (libc::SIGTRAP << 8) | 0x7f;
        assert_eq!(
            TraceEvent::from_raw(pid(), trap),
            TraceEvent::Stopped {
                pid: pid(),
                signal: libc::SIGTRAP
            }
        );
    }

    #[test]
    fn test_decode_realtime_signal_is_kept_raw() {
        let rt = 40;
        let status = (rt << 8) | 0x7f;
        assert_eq!(
            TraceEvent::from_raw(pid(), status),
            TraceEvent::Stopped {
                pid: pid(),
                signal: rt
            }
        );
    }

    #[test]
    fn test_decode_termination() {
        assert_eq!(
            TraceEvent::from_raw(pid(), libc::SIGKILL),
            TraceEvent::Signaled {
                pid: pid(),
                signal: libc::SIGKILL
            }
        );
        assert_eq!(
            TraceEvent::from_raw(pid(), 0),
            TraceEvent::Exited { pid: pid(), code: 0 }
        );
        assert_eq!(
            TraceEvent::from_raw(pid(), 3 << 8),
            TraceEvent::Exited { pid: pid(), code: 3 }
        );
    }

    #[test]
    fn test_event_kinds() {
        let exit = TraceEvent::PtraceEvent {
            pid: pid(),
            event: libc::PTRACE_EVENT_EXIT,
        };
        assert_eq!(exit.kind(), "exit");
        assert_eq!(exit.pid(), pid());
        assert_eq!(event_name(99), "unknown");
    }
}
