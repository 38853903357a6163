//! Unmounting inside another process's mount namespace
//!
//! `setns(CLONE_NEWNS)` cannot be taken back by the caller, so the tracer
//! never does it itself. Each pass runs in a throwaway child:
//!
//! ```text
//!  tracer ──fork──► helper
//!    │                │ compare /proc/<spawner>/ns/mnt vs /proc/<pid>/ns/mnt
//!    │                │ setns(/proc/<pid>/ns/mnt, CLONE_NEWNS)
//!    │                │ read /proc/self/mountinfo
//!    │                │ umount2(target, MNT_DETACH) for each root mount
//!    │                ▼
//!    └── waitpid ◄── _exit
//! ```
//!
//! The helper shares nothing with the tracer after the fork. Its exit status
//! is logged, never acted upon.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use nix::sched::{setns, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info, warn};

use super::mounts::{parse_mountinfo, unmount_root_related};
use super::Concealer;
use crate::metrics::CONCEALMENTS;

/// Error type for one step of a concealment pass
#[derive(Debug)]
pub enum ConcealError {
    /// Could not read a mount namespace link
    NamespaceLookup(std::io::Error),
    /// Could not open the target's namespace file
    OpenNamespace(std::io::Error),
    /// setns() refused
    JoinNamespace(Errno),
    /// Could not read the joined namespace's mount table
    ReadMounts(std::io::Error),
    /// The mount table came back empty
    EmptyMountTable,
}

impl std::fmt::Display for ConcealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcealError::NamespaceLookup(e) => write!(f, "failed to resolve namespace: {}", e),
            ConcealError::OpenNamespace(e) => write!(f, "failed to open namespace: {}", e),
            ConcealError::JoinNamespace(e) => write!(f, "failed to join namespace: {}", e),
            ConcealError::ReadMounts(e) => write!(f, "failed to read mountinfo: {}", e),
            ConcealError::EmptyMountTable => write!(f, "empty read from mountinfo"),
        }
    }
}

impl std::error::Error for ConcealError {}

/// What a helper pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Target still shares the spawner's namespace; nothing to hide
    SharedNamespace,
    /// Namespace joined; these targets were unmounted
    Unmounted(Vec<String>),
}

/// Conceals root by unmounting from a forked helper
#[derive(Debug, Clone)]
pub struct NamespaceConcealer {
    proc_root: PathBuf,
}

impl NamespaceConcealer {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn ns_path(&self, pid: Pid) -> PathBuf {
        self.proc_root
            .join(pid.as_raw().to_string())
            .join("ns")
            .join("mnt")
    }

    /// Compare mount namespaces of the spawner and the target
    pub fn shares_namespace(&self, spawner: Pid, target: Pid) -> Result<bool, ConcealError> {
        let spawner_ns = fs::read_link(self.ns_path(spawner)).map_err(ConcealError::NamespaceLookup)?;
        let target_ns = fs::read_link(self.ns_path(target)).map_err(ConcealError::NamespaceLookup)?;
        Ok(spawner_ns == target_ns)
    }

    /// The body of the helper process.
    ///
    /// Joins `target`'s mount namespace, so this must only ever run in a
    /// process that is about to exit.
    pub fn run_pass(&self, spawner: Pid, target: Pid) -> Result<PassOutcome, ConcealError> {
        if self.shares_namespace(spawner, target)? {
            debug!(pid = target.as_raw(), "namespace shared with spawner, nothing to unmount");
            return Ok(PassOutcome::SharedNamespace);
        }

        let ns = File::open(self.ns_path(target)).map_err(ConcealError::OpenNamespace)?;
        setns(&ns, CloneFlags::CLONE_NEWNS).map_err(ConcealError::JoinNamespace)?;

        let table = read_mount_table(&self.proc_root.join("self").join("mountinfo"))?;
        let removed = unmount_root_related(&parse_mountinfo(&table), target.as_raw(), |path| {
            umount2(path, MntFlags::MNT_DETACH)
        });
        Ok(PassOutcome::Unmounted(removed))
    }
}

fn read_mount_table(path: &Path) -> Result<String, ConcealError> {
    let bytes = fs::read(path).map_err(ConcealError::ReadMounts)?;
    if bytes.is_empty() {
        return Err(ConcealError::EmptyMountTable);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl Concealer for NamespaceConcealer {
    fn conceal(&mut self, name: &str, spawner: Pid, target: Pid) {
        info!(pid = target.as_raw(), name, "hiding root");
        CONCEALMENTS.inc();

        // SAFETY: the tracer is single threaded, and the child only runs
        // `run_pass` and then `_exit`s without returning into our caller.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = match self.run_pass(spawner, target) {
                    Ok(PassOutcome::SharedNamespace) => 0,
                    Ok(PassOutcome::Unmounted(removed)) => {
                        debug!(pid = target.as_raw(), count = removed.len(), "pass complete");
                        0
                    }
                    Err(e) => {
                        warn!(pid = target.as_raw(), error = %e, "concealment pass failed");
                        1
                    }
                };
                // SAFETY: _exit skips atexit handlers and destructors that
                // belong to the parent's state.
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => reap(child, target),
            Err(e) => {
                warn!(pid = target.as_raw(), error = %e, "failed to fork concealment helper");
            }
        }
    }
}

fn reap(child: Pid, target: Pid) {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                debug!(pid = target.as_raw(), helper = child.as_raw(), code, "helper exited");
                return;
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                warn!(pid = target.as_raw(), helper = child.as_raw(), ?signal, "helper killed");
                return;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(pid = target.as_raw(), helper = child.as_raw(), error = %e, "failed to reap helper");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_self_shares_own_namespace() {
        let concealer = NamespaceConcealer::new("/proc");
        let me = getpid();
        assert!(concealer.shares_namespace(me, me).unwrap());
        assert_eq!(concealer.run_pass(me, me).unwrap(), PassOutcome::SharedNamespace);
    }

    #[test]
    fn test_missing_process_is_a_lookup_error() {
        let concealer = NamespaceConcealer::new("/proc");
        let result = concealer.run_pass(getpid(), Pid::from_raw(i32::MAX));
        assert!(matches!(result, Err(ConcealError::NamespaceLookup(_))));
    }

    #[test]
    fn test_empty_mount_table_is_an_error() {
        let path = std::env::temp_dir().join(format!("rootcloak-mountinfo-{}", std::process::id()));
        fs::write(&path, "").unwrap();
        assert!(matches!(read_mount_table(&path), Err(ConcealError::EmptyMountTable)));
        fs::remove_file(&path).unwrap();
    }
}
