//! Deciding whether a freshly spawned application needs root hidden
//!
//! ```text
//!   clone event in a spawner fork
//!          │
//!          ▼
//!   AppDetector::detect(root, spawner)
//!          │ owner uid of /proc/<root>/task     ── 0 ──────────► Privileged
//!          │ /proc/<root>/cmdline               ── placeholder ► Placeholder
//!          │ PolicyStore::reload + decide
//!          ├── Allow ────────────────────────────────────────► Allowed
//!          └── Deny ── Concealer::conceal(name, spawner, root) ► Concealed
//! ```
//!
//! `Allowed` and `Concealed` mean the application has finished identifying
//! itself and the tracer can let go of it. The other outcomes keep it traced
//! so detection runs again on its next clone.

pub mod mounts;
pub mod namespace;

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use nix::unistd::Pid;
use tracing::{debug, info};

use crate::metrics::APPS_IDENTIFIED;
use crate::policy::{ConcealmentDecision, PolicyStore};

pub use namespace::NamespaceConcealer;

/// Names a spawned process carries before it has specialized into an app
const SPAWNER_NAMES: &[&str] = &["zygote", "zygote64"];

/// Result of inspecting one lineage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Owned by uid 0; never hidden from
    Privileged,
    /// Still running under the spawner's name
    Placeholder,
    /// uid or name could not be read
    Unreadable,
    /// Identified, and the policy lets it see root
    Allowed { name: String, uid: u32 },
    /// Identified, and root was hidden from it
    Concealed { name: String, uid: u32 },
}

impl Detection {
    /// The process has its final identity; tracing it further is pointless
    pub fn is_identified(&self) -> bool {
        matches!(self, Detection::Allowed { .. } | Detection::Concealed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Detection::Privileged => "privileged",
            Detection::Placeholder => "placeholder",
            Detection::Unreadable => "unreadable",
            Detection::Allowed { .. } => "allowed",
            Detection::Concealed { .. } => "concealed",
        }
    }
}

/// Called by the tracer on every thread creation inside a spawner fork
pub trait Detector {
    fn detect(&mut self, pid: Pid, spawner: Pid) -> Detection;
}

/// Where uid and name of a process come from
pub trait ProcessInspector {
    fn owner_uid(&self, pid: Pid) -> Option<u32>;
    fn command_name(&self, pid: Pid) -> Option<String>;
}

/// Hides root from `target`
pub trait Concealer {
    fn conceal(&mut self, name: &str, spawner: Pid, target: Pid);
}

/// `ProcessInspector` over a procfs mount
#[derive(Debug, Clone)]
pub struct Procfs {
    root: PathBuf,
}

impl Procfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry(&self, pid: Pid, name: &str) -> PathBuf {
        self.root.join(pid.as_raw().to_string()).join(name)
    }
}

impl Default for Procfs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcessInspector for Procfs {
    fn owner_uid(&self, pid: Pid) -> Option<u32> {
        match fs::metadata(self.entry(pid, "task")) {
            Ok(meta) => Some(meta.uid()),
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "cannot stat task dir");
                None
            }
        }
    }

    fn command_name(&self, pid: Pid) -> Option<String> {
        match fs::read(self.entry(pid, "cmdline")) {
            Ok(bytes) => Some(process_name(&bytes)),
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "cannot read cmdline");
                None
            }
        }
    }
}

/// First word of a raw command line, cut at space, colon or NUL.
///
/// `com.example:remote` and `com.example` both come out as `com.example`.
pub fn process_name(cmdline: &[u8]) -> String {
    let end = cmdline
        .iter()
        .position(|b| matches!(b, b' ' | b':' | 0))
        .unwrap_or(cmdline.len());
    String::from_utf8_lossy(&cmdline[..end]).into_owned()
}

/// Has the process not yet taken on its application name?
pub fn is_placeholder(name: &str) -> bool {
    name.is_empty() || name.starts_with('<') || SPAWNER_NAMES.contains(&name)
}

/// The production `Detector`: procfs inspection plus the hide policy
pub struct AppDetector<I, C> {
    policy: PolicyStore,
    inspector: I,
    concealer: C,
}

impl<I: ProcessInspector, C: Concealer> AppDetector<I, C> {
    pub fn new(policy: PolicyStore, inspector: I, concealer: C) -> Self {
        Self {
            policy,
            inspector,
            concealer,
        }
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn inspector(&self) -> &I {
        &self.inspector
    }

    pub fn concealer(&self) -> &C {
        &self.concealer
    }
}

impl<I: ProcessInspector, C: Concealer> Detector for AppDetector<I, C> {
    fn detect(&mut self, pid: Pid, spawner: Pid) -> Detection {
        let uid = match self.inspector.owner_uid(pid) {
            Some(0) => return Detection::Privileged,
            Some(uid) => uid,
            None => return Detection::Unreadable,
        };

        let name = match self.inspector.command_name(pid) {
            Some(name) => name,
            None => return Detection::Unreadable,
        };
        if is_placeholder(&name) {
            debug!(pid = pid.as_raw(), uid, "not specialized yet");
            return Detection::Placeholder;
        }

        self.policy.reload();
        let detection = match self.policy.decide(uid, &name) {
            ConcealmentDecision::Allow => {
                info!(pid = pid.as_raw(), uid, name = %name, "allowing root");
                Detection::Allowed { name, uid }
            }
            ConcealmentDecision::Deny => {
                self.concealer.conceal(&name, spawner, pid);
                Detection::Concealed { name, uid }
            }
        };
        APPS_IDENTIFIED.with_label_values(&[detection.label()]).inc();
        detection
    }
}
