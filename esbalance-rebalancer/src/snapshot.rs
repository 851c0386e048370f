//! Cluster snapshot source
//!
//! Reads allocation, shard and node information from the cluster and assembles the
//! [`ClusterSnapshot`] the planner works on. Only nodes of the requested box type are
//! kept; shards are kept when either end of their placement is on a kept node.

use async_trait::async_trait;
use esbalance_core::{ClusterSnapshot, NodeRecord, ShardRecord, ShardRole, ShardState, SnapshotError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::client::{AllocationRow, ClusterApi, NodeInfoEntry, NodesInfo, ShardRow};
use crate::failover::{EndpointPool, FailoverError};

/// Allocation row the cat API reports for unassigned shards
const UNASSIGNED_NODE: &str = "UNASSIGNED";

/// Source of cluster snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Snapshot of the nodes of `box_type` and the shards placed on them
    async fn fetch(&self, box_type: &str) -> Result<ClusterSnapshot, SnapshotError>;
}

/// Names of the node attributes carrying box type and rack
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAttributes {
    pub box_type: String,
    pub rack: String,
}

impl Default for NodeAttributes {
    fn default() -> Self {
        Self {
            box_type: "box_type".to_string(),
            rack: "rack_id".to_string(),
        }
    }
}

/// Snapshot source backed by the cluster HTTP APIs
pub struct ElasticSnapshotSource {
    pool: Arc<EndpointPool<dyn ClusterApi>>,
    attributes: NodeAttributes,
}

impl ElasticSnapshotSource {
    pub fn new(pool: Arc<EndpointPool<dyn ClusterApi>>, attributes: NodeAttributes) -> Self {
        Self { pool, attributes }
    }
}

#[async_trait]
impl SnapshotSource for ElasticSnapshotSource {
    #[instrument(skip(self))]
    async fn fetch(&self, box_type: &str) -> Result<ClusterSnapshot, SnapshotError> {
        let unreachable = |e: FailoverError| SnapshotError::Unreachable(e.to_string());

        let (allocation, shards, nodes) = tokio::try_join!(
            async {
                self.pool
                    .call("cat allocation", |api| async move { api.cat_allocation().await })
                    .await
                    .map_err(unreachable)
            },
            async {
                self.pool
                    .call("cat shards", |api| async move { api.cat_shards().await })
                    .await
                    .map_err(unreachable)
            },
            async {
                self.pool
                    .call("nodes info", |api| async move { api.nodes_info().await })
                    .await
                    .map_err(unreachable)
            },
        )?;

        let snapshot = assemble_snapshot(box_type, &self.attributes, &allocation, &shards, &nodes)?;
        info!(summary = %snapshot.summary(), "Snapshot fetched");
        Ok(snapshot)
    }
}

/// Build a snapshot from raw API responses
pub fn assemble_snapshot(
    box_type: &str,
    attributes: &NodeAttributes,
    allocation: &[AllocationRow],
    shards: &[ShardRow],
    nodes: &NodesInfo,
) -> Result<ClusterSnapshot, SnapshotError> {
    let by_name: BTreeMap<&str, &NodeInfoEntry> = nodes
        .nodes
        .values()
        .map(|entry| (entry.name.as_str(), entry))
        .collect();

    let mut snapshot = ClusterSnapshot::default();
    let mut kept: BTreeSet<String> = BTreeSet::new();

    for row in allocation {
        if row.node == UNASSIGNED_NODE {
            continue;
        }
        let Some(info) = by_name.get(row.node.as_str()) else {
            warn!(node = %row.node, "Node missing from nodes info, skipping");
            continue;
        };
        let node_box = info.attributes.get(&attributes.box_type);
        if node_box.map(String::as_str) != Some(box_type) {
            debug!(node = %row.node, box_type = ?node_box, "Node not in box type");
            continue;
        }

        kept.insert(row.node.clone());
        snapshot.nodes.push(NodeRecord {
            name: row.node.clone(),
            ip: row.ip.clone().or_else(|| info.ip.clone()),
            rack: info.attributes.get(&attributes.rack).cloned(),
            box_type: node_box.cloned(),
            disk_total: parse_bytes(row.disk_total.as_deref(), "disk.total", &row.node)?,
        });
    }

    for row in shards {
        let state = ShardState::parse(&row.state);
        if state == ShardState::Unassigned {
            continue;
        }
        let Some(location) = row.node.as_deref() else {
            continue;
        };
        let label = format!("{}/{}/{}", row.index, row.shard, row.prirep);

        let (host, target) = if state == ShardState::Relocating {
            parse_relocating(location).ok_or_else(|| {
                SnapshotError::Malformed(format!("relocating shard {} has node '{}'", label, location))
            })?
        } else {
            (location.to_string(), None)
        };

        // a shard arriving from outside the box type is placed on its target
        let (node, relocating_to) = match (kept.contains(&host), target) {
            (true, Some(to)) if kept.contains(&to) => (host, Some(to)),
            (true, _) => (host, None),
            (false, Some(to)) if kept.contains(&to) => (to, None),
            _ => continue,
        };

        let number = row.shard.parse::<u32>().map_err(|_| {
            SnapshotError::Malformed(format!("shard number '{}' of {}", row.shard, row.index))
        })?;
        let role = ShardRole::from_prirep(&row.prirep).ok_or_else(|| {
            SnapshotError::Malformed(format!("prirep '{}' of {}", row.prirep, label))
        })?;

        let store = match parse_bytes(row.store.as_deref(), "store", &label)? {
            Some(size) => Some(size),
            None if state.is_movable() => None,
            None => Some(0),
        };

        if !state.is_movable() {
            warn!(shard = %label, node = %node, state = %state, "Shard cannot be moved");
        }

        snapshot.shards.push(ShardRecord {
            index: row.index.clone(),
            shard: number,
            role,
            state,
            store,
            node,
            relocating_to,
        });
    }

    Ok(snapshot)
}

/// Split a relocating shard's node field, `"from -> ip id to"`, into (from, Some(to))
pub fn parse_relocating(value: &str) -> Option<(String, Option<String>)> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    match parts.as_slice() {
        [from, "->", _ip, _id, to] => Some((from.to_string(), Some(to.to_string()))),
        _ => None,
    }
}

fn parse_bytes(value: Option<&str>, field: &str, owner: &str) -> Result<Option<u64>, SnapshotError> {
    match value {
        None => Ok(None),
        Some(text) => text.trim().parse::<u64>().map(Some).map_err(|_| {
            SnapshotError::Malformed(format!("{} '{}' of {}", field, text, owner))
        }),
    }
}
