//! Letting go of a traced process, one thread at a time
//!
//! PTRACE_DETACH is per thread and only works on a thread that is currently
//! in a ptrace stop. A running thread has to be stopped first:
//!
//! ```text
//!   set_options(tid, 0) ok? ──yes──► detach(tid)                  DIRECT
//!          │ no
//!          ▼
//!   tgkill(SIGSTOP) ok? ──yes──► wait stop ─► detach(tid)         STOP/WAIT
//!          │ no
//!          ▼
//!        give up                                                  OTHER
//! ```

use nix::sys::ptrace::Options;
use nix::unistd::Pid;
use tracing::debug;

use super::ThreadControl;

/// Detach from one thread of `group`, stopping it first if needed.
///
/// Best effort. Returns false only when the thread could neither be detached
/// directly nor stopped.
pub fn stop_and_detach<C: ThreadControl + ?Sized>(ctl: &mut C, group: Pid, target: Pid) -> bool {
    // SETOPTIONS succeeds only on a stopped tracee, which makes it a cheap probe
    if ctl.set_options(target, Options::empty()).is_ok() {
        let _ = ctl.detach(target);
        debug!(group = group.as_raw(), tid = target.as_raw(), "stop_and_detach DIRECT");
        return true;
    }

    if ctl.signal_stop(group, target).is_ok() {
        ctl.wait_until_stopped(target);
        let _ = ctl.set_options(target, Options::empty());
        let _ = ctl.detach(target);
        debug!(group = group.as_raw(), tid = target.as_raw(), "stop_and_detach STOP/WAIT");
        return true;
    }

    debug!(group = group.as_raw(), tid = target.as_raw(), "stop_and_detach OTHER");
    false
}

/// Detach from every thread of `pid`, then resume the process.
///
/// The main thread goes first, then every other entry of its task list.
/// SIGCONT is sent twice: the first one can be swallowed by a SIGSTOP that is
/// still pending on one of the threads.
pub fn detach_process<C: ThreadControl + ?Sized>(ctl: &mut C, pid: Pid) {
    debug!(pid = pid.as_raw(), "detaching");
    stop_and_detach(ctl, pid, pid);

    for tid in ctl.threads(pid) {
        if tid != pid {
            stop_and_detach(ctl, pid, tid);
        }
    }

    let _ = ctl.signal_continue(pid, pid);
    let _ = ctl.signal_continue(pid, pid);

    debug!(pid = pid.as_raw(), "detached");
}
