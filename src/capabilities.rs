//! Startup capability preflight
//!
//! The tracer needs three powers that a root process normally holds but a
//! sandboxed one may not:
//!
//! ```text
//! ┌────────────────────┬──────────────────────────────────────────────┐
//! │ Capability         │ Used for                                     │
//! ├────────────────────┼──────────────────────────────────────────────┤
//! │ CAP_SYS_PTRACE     │ attaching to the spawner and its children    │
//! │ CAP_SYS_ADMIN      │ setns() and umount2() in the helper          │
//! │ CAP_KILL           │ tgkill() STOP/CONT to other users' threads   │
//! └────────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! A missing capability is only warned about. The kernel has the final say,
//! and the attach either works or fails loudly.

use caps::{CapSet, Capability};
use tracing::{debug, warn};

/// Capabilities checked at startup
pub const REQUIRED_CAPS: &[Capability] = &[
    Capability::CAP_SYS_PTRACE,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_KILL,
];

// ═══════════════════════════════════════════════════════════════════════════
// missing_capabilities() - Which required caps are not effective?
// ═══════════════════════════════════════════════════════════════════════════
// A capability whose state cannot be read counts as missing.
// ═══════════════════════════════════════════════════════════════════════════
pub fn missing_capabilities() -> Vec<Capability> {
    missing_from(REQUIRED_CAPS, |cap| {
        caps::has_cap(None, CapSet::Effective, cap).unwrap_or(false)
    })
}

fn missing_from<F>(required: &[Capability], has: F) -> Vec<Capability>
where
    F: Fn(Capability) -> bool,
{
    required.iter().copied().filter(|cap| !has(*cap)).collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// preflight() - Log what the tracer is about to run without
// ═══════════════════════════════════════════════════════════════════════════
// RETURNS:
//   true when every required capability is effective
// ═══════════════════════════════════════════════════════════════════════════
pub fn preflight() -> bool {
    let missing = missing_capabilities();
    if missing.is_empty() {
        debug!("all required capabilities present");
        return true;
    }
    for cap in &missing {
        warn!(capability = %cap, "capability not in effective set");
    }
    false
}
