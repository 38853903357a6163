//! Per-pid trace state and fork/clone lineage
//!
//! Every task the tracer learns about is in one of four states:
//!
//! ```text
//!   Untracked ──fork/vfork/clone event──► AwaitingFirstStop(lineage)
//!                                               │ first signal stop
//!                                               ▼
//!                                         Tracked(lineage)
//!
//!   lineage = Fork { root }   descends from a direct fork of the spawner
//!           | Other           anything else we happen to trace
//! ```
//!
//! A spawner fork is its own root. Each clone of a forked task inherits the
//! resolved root of its parent, so a root chain is at most one hop long and
//! always ends in a self-loop.
//!
//! Pids are reused by the kernel; entries are overwritten when a pid shows up
//! again and dropped when the task dies or is detached.

use std::collections::HashMap;

use nix::unistd::Pid;

/// Where a traced task came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lineage {
    /// Part of an application process forked by the spawner
    Fork { root: Pid },
    /// Traced, but not part of any application lineage
    Other,
}

impl Lineage {
    pub fn is_fork(&self) -> bool {
        matches!(self, Lineage::Fork { .. })
    }
}

/// Trace state of a single pid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceState {
    #[default]
    Untracked,
    AwaitingFirstStop(Lineage),
    Tracked(Lineage),
}

impl TraceState {
    pub fn lineage(&self) -> Option<Lineage> {
        match *self {
            TraceState::Untracked => None,
            TraceState::AwaitingFirstStop(lineage) | TraceState::Tracked(lineage) => Some(lineage),
        }
    }

    pub fn is_fork(&self) -> bool {
        self.lineage().map_or(false, |l| l.is_fork())
    }

    /// Lineage root pointer, if this pid belongs to a spawner fork
    pub fn root(&self) -> Option<Pid> {
        match self.lineage() {
            Some(Lineage::Fork { root }) => Some(root),
            _ => None,
        }
    }

    pub fn awaiting_first_stop(&self) -> bool {
        matches!(self, TraceState::AwaitingFirstStop(_))
    }
}

/// Pid-indexed trace states, owned by the tracer's control thread
#[derive(Debug, Default)]
pub struct LineageTable {
    states: HashMap<Pid, TraceState>,
}

impl LineageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, pid: Pid) -> TraceState {
        self.states.get(&pid).copied().unwrap_or_default()
    }

    /// Number of pids with a non-default state
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// The spawner forked `child`: a new lineage rooted at `child`.
    pub fn record_spawner_fork(&mut self, child: Pid) {
        self.states.insert(
            child,
            TraceState::AwaitingFirstStop(Lineage::Fork { root: child }),
        );
    }

    /// `parent`, part of a spawner fork, cloned a thread `child`.
    ///
    /// Returns the lineage root the thread was attached to. If the parent's
    /// chain is broken (its root is already gone) the thread is recorded as
    /// `Other` and `None` is returned.
    pub fn record_thread(&mut self, parent: Pid, child: Pid) -> Option<Pid> {
        match self.resolve(parent) {
            Some(root) => {
                self.states
                    .insert(child, TraceState::AwaitingFirstStop(Lineage::Fork { root }));
                Some(root)
            }
            None => {
                self.record_other(child);
                None
            }
        }
    }

    /// Any other fork/vfork/clone: traced, no lineage.
    pub fn record_other(&mut self, child: Pid) {
        self.states
            .insert(child, TraceState::AwaitingFirstStop(Lineage::Other));
    }

    /// Consume the first-stop marker of `pid`.
    ///
    /// Returns the lineage when this was the pid's first stop, `None` if the
    /// pid was not waiting for one.
    pub fn first_stop(&mut self, pid: Pid) -> Option<Lineage> {
        let state = self.states.get_mut(&pid)?;
        match *state {
            TraceState::AwaitingFirstStop(lineage) => {
                *state = TraceState::Tracked(lineage);
                Some(lineage)
            }
            _ => None,
        }
    }

    /// Follow root pointers from `pid` to the lineage root.
    ///
    /// Stops at the first self-referencing entry. Returns `None` when the
    /// chain reaches a pid that is untracked or not a spawner fork. The hop
    /// count is bounded by the table size, so this always terminates.
    pub fn resolve(&self, pid: Pid) -> Option<Pid> {
        let mut current = pid;
        for _ in 0..=self.states.len() {
            match self.state(current).root() {
                Some(root) if root == current => return Some(current),
                Some(root) => current = root,
                None => return None,
            }
        }
        None
    }

    /// Forget `pid` (died, or left tracing)
    pub fn clear(&mut self, pid: Pid) {
        self.states.remove(&pid);
    }

    /// Forget every pid whose lineage root is `root`, the root included
    pub fn clear_lineage(&mut self, root: Pid) {
        self.states.retain(|_, state| state.root() != Some(root));
    }
}
