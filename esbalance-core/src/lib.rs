//! esbalance Core Library
//!
//! Disk-usage balancing for search clusters, without any I/O.
//! This crate provides:
//! - Cluster snapshot records (nodes and shard placements)
//! - The cluster model with rack-awareness checks and simulated swaps
//! - Swap rules as pure predicates
//! - The balance planner producing bounded, rack-safe swap plans

pub mod error;
pub mod model;
pub mod planner;
pub mod rules;
pub mod snapshot;

pub use error::{BalanceError, Result, SnapshotError};
pub use model::{ClusterModel, Node, Shard, ShardGroup, ShardId};
pub use planner::{plan, Planner, PlannerConfig, ShardMove, StopReason, SwapOperation, SwapPlan};
pub use snapshot::{ClusterSnapshot, NodeRecord, ShardRecord, ShardRole, ShardState};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Human-friendly byte count (KiB, MiB, GiB, TiB)
pub fn format_bytes(bytes: u64) -> String {
    let value = bytes as f64;
    if bytes >= TIB {
        format!("{:.2}TiB", value / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2}GiB", value / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2}MiB", value / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2}KiB", value / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}
