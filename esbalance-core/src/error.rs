//! Error types for esbalance
//!
//! Snapshot errors are fatal and abort a run before planning. Balance errors come
//! out of the planner and the simulated model.

use thiserror::Error;

/// Result type alias for planning operations
pub type Result<T> = std::result::Result<T, BalanceError>;

/// Failure to obtain or interpret a cluster snapshot
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnapshotError {
    // ===== Incomplete data =====
    #[error("Duplicate node in snapshot: {0}")]
    DuplicateNode(String),

    #[error("Node {node} has no rack attribute")]
    MissingRack { node: String },

    #[error("Shard {shard} has no store size")]
    MissingSize { shard: String },

    #[error("Shard {shard} references unknown node {node}")]
    UnknownNode { shard: String, node: String },

    // ===== Transport =====
    #[error("Malformed cluster response: {0}")]
    Malformed(String),

    #[error("Cluster unreachable: {0}")]
    Unreachable(String),
}

/// Errors raised while planning
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BalanceError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("No nodes with box type '{0}'")]
    NoEligibleNodes(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Swap no longer applies: {0}")]
    StaleSwap(String),
}
