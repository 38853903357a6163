//! Prometheus counters for the tracer
//!
//! Nothing scrapes these; the text exposition is written to the debug log
//! when the tracer exits.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Trace Loop Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Events returned by wait, by kind.
    ///
    /// Labels:
    /// - kind: "fork", "vfork", "clone", "exit", "stopped", "signaled", "exited", "other"
    pub static ref TRACE_EVENTS: IntCounterVec = register_int_counter_vec!(
        "rootcloak_trace_events_total",
        "Trace events observed by the tracer",
        &["kind"]
    ).expect("failed to register TRACE_EVENTS metric");

    /// Pids with trace state currently held.
    pub static ref TRACKED_PIDS: IntGauge = register_int_gauge!(
        "rootcloak_tracked_pids",
        "Pids the tracer currently holds state for"
    ).expect("failed to register TRACKED_PIDS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Application Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Applications that finished identifying themselves, by outcome.
    ///
    /// Labels:
    /// - outcome: "allowed" or "concealed"
    pub static ref APPS_IDENTIFIED: IntCounterVec = register_int_counter_vec!(
        "rootcloak_apps_identified_total",
        "Applications identified by uid and process name",
        &["outcome"]
    ).expect("failed to register APPS_IDENTIFIED metric");

    /// Concealment helpers started.
    pub static ref CONCEALMENTS: IntCounter = register_int_counter!(
        "rootcloak_concealments_total",
        "Concealment passes started"
    ).expect("failed to register CONCEALMENTS metric");

    /// Application lineages released from tracing.
    pub static ref LINEAGES_DETACHED: IntCounter = register_int_counter!(
        "rootcloak_lineages_detached_total",
        "Application lineages detached after identification"
    ).expect("failed to register LINEAGES_DETACHED metric");
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
