//! Identifier generation for graph nodes and plans.
//!
//! Node ids are opaque strings but time-sortable: a millisecond wall-clock
//! prefix plus a process-wide counter that disambiguates nodes created
//! inside the same millisecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NODE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Wall-clock milliseconds since the UNIX epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A fresh node id, unique within the process and lexically time-sortable
/// for ids minted in the same process run.
pub fn next_node_id() -> String {
    let seq = NODE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("node_{:013}_{:06}", now_millis(), seq % 1_000_000)
}

/// A fresh plan id.
pub fn next_plan_id() -> String {
    format!("plan_{:013}", now_millis())
}
