//! Fork/clone tracer: the main event loop
//!
//! One `ForkTracer` is attached to one spawner for the spawner's lifetime.
//!
//! ```text
//!  attach(spawner) ─► wait stop ─► SETOPTIONS(FORK|VFORK|CLONE|EXIT) ─► CONT
//!        │
//!        ▼
//!  ┌─► wait_any() ──────────────────────────────────────────────────────────┐
//!  │     FORK/VFORK by spawner     new lineage rooted at the child           │
//!  │     CLONE by a spawner fork   thread joins the lineage; detect(root)    │
//!  │                               identified? detach the whole lineage      │
//!  │     other FORK/VFORK/CLONE    traced, no lineage                        │
//!  │     EXIT                      spawner: stop. else: resume and forget    │
//!  │     first stop of a child     spawner fork: narrow options to CLONE     │
//!  │     other signal stop         forward the signal (SIGSTOP is ours)      │
//!  │     killed / exited           spawner: stop. else: forget               │
//!  └────────────────────────────────────────────────────────────────────────┘
//!        │ stop
//!        ▼
//!  DETACH(spawner) ─► SIGCONT(spawner)
//! ```
//!
//! Detection is deferred to the first CLONE of a spawner fork: by the time an
//! application process starts its second thread, the spawner has already set
//! its final name and unshared its mount namespace.

use libc::c_int;
use nix::errno::Errno;
use nix::sys::ptrace::Options;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::conceal::{Detection, Detector};
use crate::error::TracerError;
use crate::lineage::{Lineage, LineageTable};
use crate::metrics::{LINEAGES_DETACHED, TRACE_EVENTS, TRACKED_PIDS};
use crate::ptrace::{event_name, TraceBackend, TraceEvent};

/// Options set on the spawner right after attaching.
///
/// EXEC and syscall stops are deliberately absent.
pub fn spawner_options() -> Options {
    Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEEXIT
}

/// Options for an application process: only its own threads matter
pub fn fork_options() -> Options {
    Options::PTRACE_O_TRACECLONE
}

/// Whether the loop keeps going after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The spawner reported PTRACE_EVENT_EXIT
    SpawnerExiting,
    /// The spawner was killed or exited
    SpawnerDied,
    /// wait failed for good (ECHILD: nothing left to trace)
    WaitFailed(Errno),
}

/// Counters for one tracer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSummary {
    pub events: u64,
    pub spawner_forks: u64,
    pub identified: u64,
    pub concealed: u64,
    pub lineages_detached: u64,
    pub signals_forwarded: u64,
    pub stop_reason: Option<StopReason>,
}

/// What to do with the stopped task after an event
enum Resume {
    /// PTRACE_CONT with this signal (0 for none)
    With(c_int),
    /// Already resumed or detached
    Skip,
    /// Left tracing; drop its state
    Forget,
}

pub struct ForkTracer<B, D> {
    backend: B,
    detector: D,
    spawner: Pid,
    lineage: LineageTable,
    summary: TraceSummary,
}

impl<B: TraceBackend, D: Detector> ForkTracer<B, D> {
    pub fn new(backend: B, detector: D, spawner: Pid) -> Self {
        Self {
            backend,
            detector,
            spawner,
            lineage: LineageTable::new(),
            summary: TraceSummary::default(),
        }
    }

    pub fn spawner(&self) -> Pid {
        self.spawner
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn lineage(&self) -> &LineageTable {
        &self.lineage
    }

    pub fn summary(&self) -> &TraceSummary {
        &self.summary
    }

    /// Attach to the spawner and start reporting its forks and clones.
    ///
    /// The only fatal failure of the tracer.
    pub fn attach(&mut self) -> Result<(), TracerError> {
        let pid = self.spawner;
        self.backend
            .attach(pid)
            .map_err(|errno| TracerError::AttachFailed {
                pid: pid.as_raw(),
                errno,
            })?;
        info!(pid = pid.as_raw(), "Attached to spawner");

        self.backend.wait_until_stopped(pid);
        if let Err(e) = self.backend.set_options(pid, spawner_options()) {
            warn!(pid = pid.as_raw(), error = %e, "failed to set spawner trace options");
        }
        if let Err(e) = self.backend.cont(pid, 0) {
            warn!(pid = pid.as_raw(), error = %e, "failed to resume spawner");
        }
        Ok(())
    }

    /// Attach, trace until the spawner goes away, then let it go
    pub fn run(&mut self) -> Result<TraceSummary, TracerError> {
        self.attach()?;

        loop {
            match self.backend.wait_any() {
                Ok(event) => {
                    if self.handle(event) == Flow::Stop {
                        break;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    info!(error = %errno, "wait failed, stopping");
                    self.summary.stop_reason = Some(StopReason::WaitFailed(errno));
                    break;
                }
            }
        }

        self.finish();
        Ok(self.summary.clone())
    }

    /// Process one event from wait
    pub fn handle(&mut self, event: TraceEvent) -> Flow {
        self.summary.events += 1;
        TRACE_EVENTS.with_label_values(&[event.kind()]).inc();

        let pid = event.pid();
        let next = match event {
            TraceEvent::PtraceEvent { pid, event } => match event {
                libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                    self.on_spawn(pid, event)
                }
                libc::PTRACE_EVENT_EXIT if pid == self.spawner => {
                    info!(pid = pid.as_raw(), "spawner exiting");
                    return self.stop(StopReason::SpawnerExiting);
                }
                libc::PTRACE_EVENT_EXIT => {
                    debug!(pid = pid.as_raw(), "exiting");
                    if let Err(e) = self.backend.cont(pid, 0) {
                        debug!(pid = pid.as_raw(), error = %e, "resume of exiting task failed");
                    }
                    Resume::Forget
                }
                other => {
                    debug!(pid = pid.as_raw(), event = other, "unexpected ptrace event");
                    Resume::With(0)
                }
            },
            TraceEvent::Stopped { pid, signal } => self.on_signal_stop(pid, signal),
            TraceEvent::Signaled { pid, signal } => {
                debug!(pid = pid.as_raw(), signal, "signaled");
                if pid == self.spawner {
                    info!(pid = pid.as_raw(), signal, "spawner killed");
                    return self.stop(StopReason::SpawnerDied);
                }
                Resume::Forget
            }
            TraceEvent::Exited { pid, code } => {
                debug!(pid = pid.as_raw(), code, "died");
                if pid == self.spawner {
                    info!(pid = pid.as_raw(), code, "spawner exited");
                    return self.stop(StopReason::SpawnerDied);
                }
                Resume::Forget
            }
            TraceEvent::Other { pid, status } => {
                debug!(pid = pid.as_raw(), status, "status");
                Resume::With(0)
            }
        };

        match next {
            Resume::With(signal) => {
                if let Err(e) = self.backend.cont(pid, signal) {
                    debug!(pid = pid.as_raw(), signal, error = %e, "resume failed");
                }
            }
            Resume::Skip => {}
            Resume::Forget => self.lineage.clear(pid),
        }
        TRACKED_PIDS.set(self.lineage.len() as i64);
        Flow::Continue
    }

    fn stop(&mut self, reason: StopReason) -> Flow {
        self.summary.stop_reason = Some(reason);
        Flow::Stop
    }

    /// FORK, VFORK or CLONE reported by `pid`
    fn on_spawn(&mut self, pid: Pid, event: c_int) -> Resume {
        let child = match self.backend.event_message(pid) {
            Ok(child) => child,
            Err(e) => {
                warn!(pid = pid.as_raw(), event = event_name(event), error = %e, "no child pid for event");
                return Resume::With(0);
            }
        };
        debug!(pid = pid.as_raw(), child = child.as_raw(), event = event_name(event), "trapped");

        let is_clone = event == libc::PTRACE_EVENT_CLONE;
        if pid == self.spawner && !is_clone {
            self.summary.spawner_forks += 1;
            self.lineage.record_spawner_fork(child);
            return Resume::With(0);
        }

        if is_clone && self.lineage.state(pid).is_fork() {
            if let Some(root) = self.lineage.record_thread(pid, child) {
                let detection = self.detector.detect(root, self.spawner);
                debug!(root = root.as_raw(), child = child.as_raw(), outcome = detection.label(), "identity check");
                if detection.is_identified() {
                    self.summary.identified += 1;
                    if matches!(detection, Detection::Concealed { .. }) {
                        self.summary.concealed += 1;
                    }
                    self.release(pid, root);
                    return Resume::Skip;
                }
            }
            return Resume::With(0);
        }

        self.lineage.record_other(child);
        Resume::With(0)
    }

    /// Resume the reporting thread, then detach every thread of `root`.
    ///
    /// The reporting thread may already be gone; the rest of the lineage is
    /// detached regardless, since its state is dropped here.
    fn release(&mut self, pid: Pid, root: Pid) {
        if let Err(e) = self.backend.cont(pid, 0) {
            debug!(pid = pid.as_raw(), root = root.as_raw(), error = %e, "resume before detach failed");
        }
        self.backend.detach_process(root);
        self.lineage.clear_lineage(root);
        self.summary.lineages_detached += 1;
        LINEAGES_DETACHED.inc();
        info!(pid = root.as_raw(), "application released");
    }

    fn on_signal_stop(&mut self, pid: Pid, signal: c_int) -> Resume {
        if signal == libc::SIGTRAP {
            debug!(pid = pid.as_raw(), "plain trap");
            return Resume::With(0);
        }

        if let Some(lineage) = self.lineage.first_stop(pid) {
            debug!(pid = pid.as_raw(), signal, fork = lineage.is_fork(), "stopped (first)");
            if let Lineage::Fork { .. } = lineage {
                if let Err(e) = self.backend.set_options(pid, fork_options()) {
                    debug!(pid = pid.as_raw(), error = %e, "failed to narrow trace options");
                }
            }
            return Resume::With(0);
        }

        if signal == libc::SIGSTOP {
            debug!(pid = pid.as_raw(), "dropping our own SIGSTOP");
            return Resume::With(0);
        }

        debug!(pid = pid.as_raw(), signal, "forwarding signal");
        self.summary.signals_forwarded += 1;
        Resume::With(signal)
    }

    /// Detach from the spawner and make sure it runs
    pub fn finish(&mut self) {
        let pid = self.spawner;
        if let Err(e) = self.backend.detach(pid) {
            warn!(pid = pid.as_raw(), error = %e, "detach from spawner failed");
        }
        if let Err(e) = self.backend.resume(pid) {
            warn!(pid = pid.as_raw(), error = %e, "failed to resume spawner");
        }
        info!(pid = pid.as_raw(), "Detached from spawner");
    }
}
