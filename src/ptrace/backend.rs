//! Live `TraceBackend` talking to the kernel

use std::fs;
use std::path::PathBuf;
use std::ptr;
use std::time::Duration;

use libc::{c_int, c_ulong, c_void};
use nix::errno::Errno;
use nix::sys::ptrace::Options;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use super::primitives::{self, trace, wait_raw, Request};
use super::{ThreadControl, TraceBackend, TraceEvent};
use crate::config::TracerConfig;

/// ptrace(2) based backend
#[derive(Debug, Clone)]
pub struct Ptrace {
    proc_root: PathBuf,
    stop_timeout: Duration,
    poll_interval: Duration,
}

impl Ptrace {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            proc_root: config.proc_root.clone(),
            stop_timeout: config.stop_timeout(),
            poll_interval: config.stop_poll_interval(),
        }
    }

    fn request(&self, request: Request, pid: Pid, data: usize) -> nix::Result<()> {
        // SAFETY: none of these requests dereference addr or data
        unsafe { trace(request, pid, ptr::null_mut(), data as *mut c_void) }.map(drop)
    }
}

impl Default for Ptrace {
    fn default() -> Self {
        Self::new(&TracerConfig::default())
    }
}

impl ThreadControl for Ptrace {
    fn set_options(&mut self, tid: Pid, options: Options) -> nix::Result<()> {
        self.request(Request::SetOptions, tid, options.bits() as usize)
    }

    fn detach(&mut self, tid: Pid) -> nix::Result<()> {
        self.request(Request::Detach, tid, 0)
    }

    fn signal_stop(&mut self, tgid: Pid, tid: Pid) -> nix::Result<()> {
        primitives::signal_stop(tgid, tid)
    }

    fn signal_continue(&mut self, tgid: Pid, tid: Pid) -> nix::Result<()> {
        primitives::signal_continue(tgid, tid)
    }

    fn wait_until_stopped(&mut self, tid: Pid) {
        primitives::wait_until_stopped(tid, self.stop_timeout, self.poll_interval)
    }

    fn threads(&mut self, pid: Pid) -> Vec<Pid> {
        let task_dir = self.proc_root.join(pid.as_raw().to_string()).join("task");
        let entries = match fs::read_dir(&task_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "cannot list threads");
                return Vec::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter(|tid| *tid > 0)
            .map(Pid::from_raw)
            .collect()
    }
}

impl TraceBackend for Ptrace {
    fn attach(&mut self, pid: Pid) -> nix::Result<()> {
        self.request(Request::Attach, pid, 0)
    }

    fn cont(&mut self, pid: Pid, signal: c_int) -> nix::Result<()> {
        self.request(Request::Cont, pid, signal as usize)
    }

    fn event_message(&mut self, pid: Pid) -> nix::Result<Pid> {
        let mut message: c_ulong = 0;
        // SAFETY: GETEVENTMSG writes one unsigned long through data
        unsafe {
            trace(
                Request::GetEventMsg,
                pid,
                ptr::null_mut(),
                &mut message as *mut c_ulong as *mut c_void,
            )
        }?;
        Ok(Pid::from_raw(message as i32))
    }

    fn wait_any(&mut self) -> nix::Result<TraceEvent> {
        loop {
            match wait_raw(Pid::from_raw(-1), libc::__WALL) {
                Ok(Some((pid, status))) => return Ok(TraceEvent::from_raw(pid, status)),
                Ok(None) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn resume(&mut self, pid: Pid) -> nix::Result<()> {
        kill(pid, Signal::SIGCONT)
    }
}
