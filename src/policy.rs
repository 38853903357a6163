//! Hide policy: which applications must not see root
//!
//! The policy lives in a plain text file of whitespace separated tokens. A
//! token that parses as a positive integer is a uid, anything else is a
//! process name:
//!
//! ```text
//! 10050 10123
//! com.example.bank
//! com.example.game:remote
//! ```
//!
//! Both tables are fail-open. An empty uid table restricts nobody by uid, an
//! empty name table restricts nobody by name. A missing policy file therefore
//! means "hide from nobody".
//!
//! The store is only ever touched from the tracer's control thread, so the
//! tables are swapped in place without any locking.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

/// Uids per Android user (AID_USER)
pub const USER_RANGE: u32 = 100_000;

/// First application uid within a user (AID_APP)
pub const APP_RANGE_START: u32 = 10_000;

/// Returns true for uids in the system range of any user.
///
/// These always keep root, whatever the policy says.
pub fn is_system_uid(uid: u32) -> bool {
    uid % USER_RANGE < APP_RANGE_START
}

/// Parsed policy tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HidePolicy {
    uids: Vec<u32>,
    names: Vec<String>,
}

impl HidePolicy {
    /// Parse policy text.
    ///
    /// Runs two passes over the tokens: the first counts uids and names, the
    /// second fills tables allocated to exactly those sizes.
    pub fn parse(text: &str) -> Self {
        let tokens = || {
            text.split(|c: char| c == ' ' || c == '\r' || c == '\n' || c == '\t')
                .filter(|t| !t.is_empty())
        };

        let mut uid_count = 0;
        let mut name_count = 0;
        for token in tokens() {
            match parse_uid(token) {
                Some(_) => uid_count += 1,
                None => name_count += 1,
            }
        }

        let mut uids = Vec::with_capacity(uid_count);
        let mut names = Vec::with_capacity(name_count);
        for token in tokens() {
            match parse_uid(token) {
                Some(uid) => {
                    debug!(index = uids.len(), uid, "policy uid");
                    uids.push(uid);
                }
                None => {
                    debug!(index = names.len(), name = token, "policy process");
                    names.push(token.to_string());
                }
            }
        }

        Self { uids, names }
    }

    pub fn uids(&self) -> &[u32] {
        &self.uids
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty() && self.names.is_empty()
    }

    /// Is root allowed for this uid?
    ///
    /// False only when `uid` is an application uid listed in a non-empty uid
    /// table.
    pub fn allows_uid(&self, uid: u32) -> bool {
        if is_system_uid(uid) {
            return true;
        }
        if self.uids.is_empty() {
            return true;
        }
        !self.uids.contains(&uid)
    }

    /// Is root allowed for this process name? Exact match only.
    pub fn allows_name(&self, name: &str) -> bool {
        if self.names.is_empty() {
            return true;
        }
        !self.names.iter().any(|n| n == name)
    }

    /// Deny if either dimension denies.
    pub fn decide(&self, uid: u32, name: &str) -> ConcealmentDecision {
        if self.allows_uid(uid) && self.allows_name(name) {
            ConcealmentDecision::Allow
        } else {
            ConcealmentDecision::Deny
        }
    }
}

fn parse_uid(token: &str) -> Option<u32> {
    token.parse::<u32>().ok().filter(|uid| *uid > 0)
}

/// Outcome of a policy query for one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcealmentDecision {
    /// Process may see root
    Allow,
    /// Root must be hidden from the process
    Deny,
}

/// File-backed policy, re-read when the file's mtime changes
#[derive(Debug)]
pub struct PolicyStore {
    path: PathBuf,
    policy: HidePolicy,
    last_modified: Option<SystemTime>,
    reads: u64,
}

impl PolicyStore {
    /// Create a store for `path`. Nothing is read until [`reload`](Self::reload).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            policy: HidePolicy::default(),
            last_modified: None,
            reads: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &HidePolicy {
        &self.policy
    }

    /// Number of times the backing file has actually been read
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Re-read the policy file if its modification time moved.
    ///
    /// Returns true when the tables were replaced. Any failure (missing file,
    /// unreadable file) keeps the current tables and is retried next call.
    pub fn reload(&mut self) -> bool {
        let modified = match fs::symlink_metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "policy file unavailable");
                return false;
            }
        };
        if self.last_modified == Some(modified) {
            return false;
        }

        self.reads += 1;
        let text = match fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "policy file unreadable");
                return false;
            }
        };

        self.policy = HidePolicy::parse(&text);
        self.last_modified = Some(modified);
        debug!(
            uids = self.policy.uids.len(),
            names = self.policy.names.len(),
            "policy reloaded"
        );
        true
    }

    pub fn allows_uid(&self, uid: u32) -> bool {
        self.policy.allows_uid(uid)
    }

    pub fn allows_name(&self, name: &str) -> bool {
        self.policy.allows_name(name)
    }

    pub fn decide(&self, uid: u32, name: &str) -> ConcealmentDecision {
        self.policy.decide(uid, name)
    }
}
