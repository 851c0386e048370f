//! Swap rules
//!
//! Pure predicates the planner combines when deciding whether a node pair is worth
//! working on and whether a shard pair may be exchanged.

use crate::model::Node;

/// Relative usage gap `(source - target) / source`
///
/// Returns 0 when the source is empty or not larger than the target.
pub fn gap_ratio(source_usage: u64, target_usage: u64) -> f64 {
    if source_usage == 0 || target_usage >= source_usage {
        return 0.0;
    }
    (source_usage - target_usage) as f64 / source_usage as f64
}

/// Relative size difference `(larger - smaller) / larger`
pub fn size_ratio(larger: u64, smaller: u64) -> f64 {
    if larger == 0 || smaller >= larger {
        return 0.0;
    }
    (larger - smaller) as f64 / larger as f64
}

/// Node pair is far enough apart to be worth exchanging between
pub fn meets_node_threshold(source_usage: u64, target_usage: u64, node_pct: f64) -> bool {
    gap_ratio(source_usage, target_usage) >= node_pct
}

/// Shard pair differs enough to be worth relocating
pub fn meets_shard_threshold(larger: u64, smaller: u64, shard_pct: f64) -> bool {
    larger > smaller && size_ratio(larger, smaller) >= shard_pct
}

/// Exchanging the shards narrows the gap instead of overshooting it
///
/// The gap changes by twice the size difference, so the difference must stay below it.
pub fn reduces_gap(larger: u64, smaller: u64, gap: u64) -> bool {
    larger > smaller && larger - smaller < gap
}

/// Node stays within its disk after giving up `outgoing` and receiving `incoming`
pub fn fits_capacity(usage: u64, outgoing: u64, incoming: u64, capacity: Option<u64>) -> bool {
    match capacity {
        Some(capacity) => usage.saturating_sub(outgoing).saturating_add(incoming) <= capacity,
        None => true,
    }
}

/// Node belongs to the box type being balanced
pub fn in_box_type(node: &Node, box_type: &str) -> bool {
    node.box_type.as_deref() == Some(box_type)
}
