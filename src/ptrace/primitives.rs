//! Raw syscalls behind the trace wrapper
//!
//! `trace()` is the only place `libc::ptrace` is called. It logs every
//! failure and hands the errno back untouched.

use std::thread;
use std::time::{Duration, Instant};

use libc::{c_int, c_long, c_void};
use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::debug;

/// The ptrace requests this crate issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Attach,
    Detach,
    Cont,
    SetOptions,
    GetEventMsg,
}

/// Forward one request to `ptrace(2)`.
///
/// On failure the request, pid, addr, data and errno are logged at debug and
/// the errno is returned. Nothing here decides whether a failure matters.
///
/// # Safety
///
/// `addr` and `data` are passed straight to the kernel. For requests that
/// write through `data` (GETEVENTMSG) it must point to writable memory of the
/// size the kernel expects.
pub unsafe fn trace(
    request: Request,
    pid: Pid,
    addr: *mut c_void,
    data: *mut c_void,
) -> nix::Result<c_long> {
    let raw = pid.as_raw();
    let ret = match request {
        Request::Attach => libc::ptrace(libc::PTRACE_ATTACH, raw, addr, data),
        Request::Detach => libc::ptrace(libc::PTRACE_DETACH, raw, addr, data),
        Request::Cont => libc::ptrace(libc::PTRACE_CONT, raw, addr, data),
        Request::SetOptions => libc::ptrace(libc::PTRACE_SETOPTIONS, raw, addr, data),
        Request::GetEventMsg => libc::ptrace(libc::PTRACE_GETEVENTMSG, raw, addr, data),
    };
    if ret == -1 {
        let errno = Errno::last();
        debug!(
            ?request,
            pid = raw,
            addr = addr as usize,
            data = data as usize,
            errno = errno as i32,
            "TRACE failed"
        );
        return Err(errno);
    }
    Ok(ret)
}

fn tgkill(tgid: Pid, tid: Pid, signal: c_int) -> nix::Result<()> {
    // SAFETY: tgkill takes three integers and touches no memory of ours.
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, tgid.as_raw(), tid.as_raw(), signal) };
    Errno::result(ret).map(drop)
}

/// SIGSTOP one thread of a thread group (not the whole group)
pub fn signal_stop(tgid: Pid, tid: Pid) -> nix::Result<()> {
    tgkill(tgid, tid, libc::SIGSTOP)
}

/// SIGCONT one thread of a thread group
pub fn signal_continue(tgid: Pid, tid: Pid) -> nix::Result<()> {
    tgkill(tgid, tid, libc::SIGCONT)
}

/// `waitpid` returning the raw status; `Ok(None)` when WNOHANG found nothing
pub(crate) fn wait_raw(pid: Pid, flags: c_int) -> nix::Result<Option<(Pid, c_int)>> {
    let mut status: c_int = 0;
    // SAFETY: status is a valid, writable c_int for the duration of the call.
    let ret = unsafe { libc::waitpid(pid.as_raw(), &mut status, flags) };
    match Errno::result(ret)? {
        0 => Ok(None),
        reported => Ok(Some((Pid::from_raw(reported), status))),
    }
}

/// Poll until `target` reports a stop, giving up after `timeout`.
///
/// The bound matters: a target that died in the meantime is a zombie and will
/// never report a stop.
pub fn wait_until_stopped(target: Pid, timeout: Duration, poll_interval: Duration) {
    debug!(pid = target.as_raw(), "wait_stop");
    let start = Instant::now();
    loop {
        match wait_raw(target, libc::__WALL | libc::WNOHANG) {
            Ok(Some((pid, status))) if pid == target && libc::WIFSTOPPED(status) => break,
            Ok(_) => {
                if start.elapsed() > timeout {
                    debug!(pid = target.as_raw(), "wait_stop timeout, zombie?");
                    break;
                }
                thread::sleep(poll_interval);
            }
            Err(e) => {
                debug!(pid = target.as_raw(), error = %e, "wait_stop error");
                break;
            }
        }
    }
}
