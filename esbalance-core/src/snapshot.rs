//! Cluster snapshot
//!
//! Plain records describing nodes and shard placements as observed at one point in
//! time. Snapshot sources produce these; [`crate::ClusterModel::build`] validates them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary or replica copy of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardRole {
    Primary,
    Replica,
}

impl ShardRole {
    /// Parse the `prirep` column of `_cat/shards`
    pub fn from_prirep(value: &str) -> Option<Self> {
        match value {
            "p" | "primary" => Some(Self::Primary),
            "r" | "replica" => Some(Self::Replica),
            _ => None,
        }
    }

    /// Single-letter form used in shard labels
    pub fn letter(&self) -> char {
        match self {
            Self::Primary => 'p',
            Self::Replica => 'r',
        }
    }
}

/// Lifecycle state reported for a shard copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    Started,
    Relocating,
    Initializing,
    Unassigned,
    Other(String),
}

impl ShardState {
    pub fn parse(value: &str) -> Self {
        match value {
            "STARTED" => Self::Started,
            "RELOCATING" => Self::Relocating,
            "INITIALIZING" => Self::Initializing,
            "UNASSIGNED" => Self::Unassigned,
            other => Self::Other(other.to_string()),
        }
    }

    /// Only started shards may be picked for a swap
    pub fn is_movable(&self) -> bool {
        matches!(self, Self::Started)
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "STARTED"),
            Self::Relocating => write!(f, "RELOCATING"),
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Unassigned => write!(f, "UNASSIGNED"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A data node as seen in the snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node name, used as the node identifier
    pub name: String,
    pub ip: Option<String>,
    /// Rack attribute used for replica awareness
    pub rack: Option<String>,
    pub box_type: Option<String>,
    /// Total disk in bytes, when reported
    pub disk_total: Option<u64>,
}

/// One shard copy as seen in the snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub index: String,
    pub shard: u32,
    pub role: ShardRole,
    pub state: ShardState,
    /// Store size in bytes
    pub store: Option<u64>,
    /// Node currently holding the copy
    pub node: String,
    /// Destination of an in-flight relocation
    pub relocating_to: Option<String>,
}

impl ShardRecord {
    /// `index/shard/p` style label for logs and errors
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.index, self.shard, self.role.letter())
    }
}

/// Immutable view of the cluster used for one planning run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub nodes: Vec<NodeRecord>,
    pub shards: Vec<ShardRecord>,
}

impl ClusterSnapshot {
    /// Summary of the snapshot
    pub fn summary(&self) -> String {
        format!("{} nodes, {} shards", self.nodes.len(), self.shards.len())
    }
}
