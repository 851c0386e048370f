//! Cluster model
//!
//! In-memory view of one snapshot: nodes keyed by name, an arena of shard copies, and
//! a shard group index from which rack occupancy is derived. The planner works on a
//! private clone and moves shards around in it to simulate accepted swaps.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

use crate::error::{BalanceError, Result, SnapshotError};
use crate::planner::SwapOperation;
use crate::rules;
use crate::snapshot::{ClusterSnapshot, ShardRecord, ShardRole, ShardState};

/// Arena index of a shard copy
///
/// Assigned in (index, shard, role, host) order so identical snapshots get identical ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub usize);

/// All copies of one (index, shard number); members must sit on distinct racks
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardGroup {
    pub index: String,
    pub shard: u32,
}

impl fmt::Display for ShardGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.shard)
    }
}

/// A shard copy placed on a node
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub id: ShardId,
    pub group: ShardGroup,
    pub role: ShardRole,
    /// Store size in bytes
    pub size: u64,
    /// Current host, updated by simulated swaps
    pub node: String,
    /// Destination of an in-flight relocation; reserves space and rack there too
    pub relocating_to: Option<String>,
    pub state: ShardState,
}

impl Shard {
    pub fn is_movable(&self) -> bool {
        self.state.is_movable() && self.relocating_to.is_none()
    }

    /// `index/shard/p` style label
    pub fn label(&self) -> String {
        format!("{}/{}", self.group, self.role.letter())
    }
}

/// A data node
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub ip: Option<String>,
    pub rack: String,
    pub box_type: Option<String>,
    /// Total disk in bytes, when known
    pub capacity: Option<u64>,
    /// Bytes of hosted shards plus shards relocating onto this node
    pub usage: u64,
    /// Shards hosted here
    pub shards: BTreeSet<ShardId>,
}

/// Nodes, shards and group placement for one planning run
#[derive(Debug, Clone)]
pub struct ClusterModel {
    nodes: BTreeMap<String, Node>,
    shards: Vec<Shard>,
    groups: BTreeMap<ShardGroup, Vec<ShardId>>,
}

impl ClusterModel {
    /// Build the model from a snapshot
    ///
    /// Fails when a node has no rack, a shard has no size, a node appears twice, or a
    /// shard points at a node the snapshot does not contain.
    pub fn build(snapshot: &ClusterSnapshot) -> std::result::Result<Self, SnapshotError> {
        let mut nodes = BTreeMap::new();
        for record in &snapshot.nodes {
            let rack = record.rack.clone().ok_or_else(|| SnapshotError::MissingRack {
                node: record.name.clone(),
            })?;
            if nodes.contains_key(&record.name) {
                return Err(SnapshotError::DuplicateNode(record.name.clone()));
            }
            nodes.insert(
                record.name.clone(),
                Node {
                    id: record.name.clone(),
                    ip: record.ip.clone(),
                    rack,
                    box_type: record.box_type.clone(),
                    capacity: record.disk_total,
                    usage: 0,
                    shards: BTreeSet::new(),
                },
            );
        }

        let mut records: Vec<&ShardRecord> = snapshot.shards.iter().collect();
        records.sort_by(|a, b| {
            a.index
                .cmp(&b.index)
                .then(a.shard.cmp(&b.shard))
                .then(a.role.cmp(&b.role))
                .then(a.node.cmp(&b.node))
        });

        let mut shards = Vec::with_capacity(records.len());
        let mut groups: BTreeMap<ShardGroup, Vec<ShardId>> = BTreeMap::new();

        for record in records {
            let size = record.store.ok_or_else(|| SnapshotError::MissingSize {
                shard: record.label(),
            })?;
            let id = ShardId(shards.len());

            if let Some(target) = &record.relocating_to {
                match nodes.get_mut(target) {
                    Some(node) => node.usage += size,
                    None => {
                        return Err(SnapshotError::UnknownNode {
                            shard: record.label(),
                            node: target.clone(),
                        })
                    }
                }
            }
            match nodes.get_mut(&record.node) {
                Some(node) => {
                    node.usage += size;
                    node.shards.insert(id);
                }
                None => {
                    return Err(SnapshotError::UnknownNode {
                        shard: record.label(),
                        node: record.node.clone(),
                    })
                }
            }

            let group = ShardGroup {
                index: record.index.clone(),
                shard: record.shard,
            };
            groups.entry(group.clone()).or_default().push(id);
            shards.push(Shard {
                id,
                group,
                role: record.role,
                size,
                node: record.node.clone(),
                relocating_to: record.relocating_to.clone(),
                state: record.state.clone(),
            });
        }

        let model = Self {
            nodes,
            shards,
            groups,
        };

        for (group, rack) in model.rack_conflicts() {
            warn!(group = %group, rack = %rack, "Snapshot already has shard copies sharing a rack");
        }
        debug!(
            nodes = model.nodes.len(),
            shards = model.shards.len(),
            groups = model.groups.len(),
            "Cluster model built"
        );

        Ok(model)
    }

    /// Look up a node
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All nodes, ordered by identifier
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Nodes of one box type, ordered by identifier
    pub fn nodes_of<'a>(&'a self, box_type: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes
            .values()
            .filter(move |node| rules::in_box_type(node, box_type))
    }

    /// Current simulated usage of a node in bytes
    pub fn usage(&self, node: &str) -> u64 {
        self.nodes.get(node).map(|n| n.usage).unwrap_or(0)
    }

    /// Shards hosted on a node, largest first
    pub fn shards_of(&self, node: &str) -> Vec<&Shard> {
        let mut hosted: Vec<&Shard> = match self.nodes.get(node) {
            Some(node) => node
                .shards
                .iter()
                .filter_map(|id| self.shards.get(id.0))
                .collect(),
            None => Vec::new(),
        };
        hosted.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then_with(|| a.group.cmp(&b.group))
                .then(a.role.cmp(&b.role))
                .then(a.id.cmp(&b.id))
        });
        hosted
    }

    /// Racks occupied by one shard copy (its host and any relocation target)
    fn racks_of(&self, id: ShardId) -> BTreeSet<&str> {
        let Some(shard) = self.shards.get(id.0) else {
            return BTreeSet::new();
        };
        std::iter::once(&shard.node)
            .chain(shard.relocating_to.iter())
            .filter_map(|node| self.nodes.get(node))
            .map(|node| node.rack.as_str())
            .collect()
    }

    /// Racks currently occupied by a shard group
    pub fn group_racks(&self, group: &ShardGroup) -> BTreeSet<&str> {
        self.groups
            .get(group)
            .into_iter()
            .flatten()
            .flat_map(|&id| self.racks_of(id))
            .collect()
    }

    /// Would moving `shard` onto `target` put two copies of its group in one rack?
    ///
    /// The copy's own placement is ignored since it is the one being vacated. Unknown
    /// shards or nodes count as a violation.
    pub fn would_violate_rack(&self, shard: ShardId, target: &str) -> bool {
        let (Some(moving), Some(target)) = (self.shards.get(shard.0), self.nodes.get(target))
        else {
            return true;
        };
        self.groups
            .get(&moving.group)
            .into_iter()
            .flatten()
            .filter(|&&member| member != shard)
            .any(|&member| self.racks_of(member).contains(target.rack.as_str()))
    }

    /// Groups with two copies in one rack, with the shared rack
    pub fn rack_conflicts(&self) -> Vec<(ShardGroup, String)> {
        let mut conflicts = BTreeSet::new();
        for (group, members) in &self.groups {
            let mut seen: BTreeMap<&str, ShardId> = BTreeMap::new();
            for &member in members {
                for rack in self.racks_of(member) {
                    match seen.get(rack) {
                        Some(&other) if other != member => {
                            conflicts.insert((group.clone(), rack.to_string()));
                        }
                        Some(_) => {}
                        None => {
                            seen.insert(rack, member);
                        }
                    }
                }
            }
        }
        conflicts.into_iter().collect()
    }

    /// Population standard deviation of usage across a box type
    pub fn usage_stddev(&self, box_type: &str) -> f64 {
        let usages: Vec<f64> = self.nodes_of(box_type).map(|n| n.usage as f64).collect();
        if usages.is_empty() {
            return 0.0;
        }
        let mean = usages.iter().sum::<f64>() / usages.len() as f64;
        let variance =
            usages.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / usages.len() as f64;
        variance.sqrt()
    }

    /// Apply a swap to the simulated placement
    ///
    /// Only the in-memory model changes; nothing is sent to the cluster.
    pub fn apply_swap(&mut self, op: &SwapOperation) -> Result<()> {
        if op.source_node == op.target_node {
            return Err(BalanceError::StaleSwap(format!(
                "source and target are both {}",
                op.source_node
            )));
        }
        self.check_host(op.outgoing.shard, &op.source_node)?;
        self.check_host(op.incoming.shard, &op.target_node)?;

        self.relocate(op.outgoing.shard, &op.target_node)?;
        self.relocate(op.incoming.shard, &op.source_node)?;
        Ok(())
    }

    fn check_host(&self, id: ShardId, expected: &str) -> Result<()> {
        match self.shards.get(id.0) {
            Some(shard) if shard.node == expected => Ok(()),
            Some(shard) => Err(BalanceError::StaleSwap(format!(
                "{} is on {}, not {}",
                shard.label(),
                shard.node,
                expected
            ))),
            None => Err(BalanceError::StaleSwap(format!("unknown shard {:?}", id))),
        }
    }

    fn relocate(&mut self, id: ShardId, to: &str) -> Result<()> {
        if !self.nodes.contains_key(to) {
            return Err(BalanceError::StaleSwap(format!("unknown node {}", to)));
        }
        let shard = self
            .shards
            .get_mut(id.0)
            .ok_or_else(|| BalanceError::StaleSwap(format!("unknown shard {:?}", id)))?;
        let from = std::mem::replace(&mut shard.node, to.to_string());
        let size = shard.size;

        if let Some(node) = self.nodes.get_mut(&from) {
            node.usage = node.usage.saturating_sub(size);
            node.shards.remove(&id);
        }
        if let Some(node) = self.nodes.get_mut(to) {
            node.usage += size;
            node.shards.insert(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::NodeRecord;

    const GB: u64 = 1024 * 1024 * 1024;

    fn node(name: &str, rack: &str, box_type: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            ip: None,
            rack: Some(rack.to_string()),
            box_type: Some(box_type.to_string()),
            disk_total: None,
        }
    }

    fn shard(index: &str, number: u32, role: ShardRole, gb: u64, node: &str) -> ShardRecord {
        ShardRecord {
            index: index.to_string(),
            shard: number,
            role,
            state: ShardState::Started,
            store: Some(gb * GB),
            node: node.to_string(),
            relocating_to: None,
        }
    }

    fn sample() -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: vec![
                node("n1", "A", "hot"),
                node("n2", "B", "hot"),
                node("n3", "C", "hot"),
                node("w1", "A", "warm"),
            ],
            shards: vec![
                shard("idx", 0, ShardRole::Primary, 100, "n1"),
                shard("idx", 0, ShardRole::Replica, 90, "n2"),
                shard("other", 0, ShardRole::Primary, 20, "n3"),
                shard("big", 1, ShardRole::Primary, 50, "n1"),
            ],
        }
    }

    #[test]
    fn test_build_computes_usage() {
        let model = ClusterModel::build(&sample()).unwrap();
        assert_eq!(model.usage("n1"), 150 * GB);
        assert_eq!(model.usage("n2"), 90 * GB);
        assert_eq!(model.usage("n3"), 20 * GB);
        assert_eq!(model.usage("w1"), 0);
        assert_eq!(model.usage("missing"), 0);
    }

    #[test]
    fn test_build_rejects_incomplete_data() {
        let mut snapshot = sample();
        snapshot.nodes[1].rack = None;
        assert_eq!(
            ClusterModel::build(&snapshot).unwrap_err(),
            SnapshotError::MissingRack {
                node: "n2".to_string()
            }
        );

        let mut snapshot = sample();
        snapshot.shards[2].store = None;
        assert!(matches!(
            ClusterModel::build(&snapshot),
            Err(SnapshotError::MissingSize { .. })
        ));

        let mut snapshot = sample();
        snapshot.shards[0].node = "ghost".to_string();
        assert!(matches!(
            ClusterModel::build(&snapshot),
            Err(SnapshotError::UnknownNode { node, .. }) if node == "ghost"
        ));

        let mut snapshot = sample();
        snapshot.nodes.push(node("n1", "Z", "hot"));
        assert_eq!(
            ClusterModel::build(&snapshot).unwrap_err(),
            SnapshotError::DuplicateNode("n1".to_string())
        );
    }

    #[test]
    fn test_nodes_of_filters_box_type() {
        let model = ClusterModel::build(&sample()).unwrap();
        let hot: Vec<_> = model.nodes_of("hot").map(|n| n.id.as_str()).collect();
        assert_eq!(hot, vec!["n1", "n2", "n3"]);
        assert_eq!(model.nodes_of("cold").count(), 0);
    }

    #[test]
    fn test_shards_of_largest_first() {
        let model = ClusterModel::build(&sample()).unwrap();
        let sizes: Vec<u64> = model.shards_of("n1").iter().map(|s| s.size).collect();
        assert_eq!(sizes, vec![100 * GB, 50 * GB]);
        assert!(model.shards_of("w1").is_empty());
    }

    #[test]
    fn test_would_violate_rack() {
        let model = ClusterModel::build(&sample()).unwrap();
        let primary = model.shards_of("n1")[0].id;
        // the replica lives on rack B
        assert!(model.would_violate_rack(primary, "n2"));
        assert!(!model.would_violate_rack(primary, "n3"));
        // w1 shares rack A with the primary itself, which is being vacated
        assert!(!model.would_violate_rack(primary, "w1"));

        let replica = model.shards_of("n2")[0].id;
        assert!(model.would_violate_rack(replica, "w1"));
        assert!(model.would_violate_rack(replica, "ghost"));
    }

    #[test]
    fn test_relocating_shard_reserves_target() {
        let mut snapshot = sample();
        snapshot.shards[2].state = ShardState::Relocating;
        snapshot.shards[2].relocating_to = Some("w1".to_string());
        snapshot
            .shards
            .push(shard("other", 0, ShardRole::Replica, 20, "n2"));
        let model = ClusterModel::build(&snapshot).unwrap();

        assert_eq!(model.usage("n3"), 20 * GB);
        assert_eq!(model.usage("w1"), 20 * GB);
        let group = ShardGroup {
            index: "other".to_string(),
            shard: 0,
        };
        let racks: Vec<_> = model.group_racks(&group).into_iter().collect();
        assert_eq!(racks, vec!["A", "B", "C"]);
        assert!(!model.shards_of("n3")[0].is_movable());

        // rack A holds no copy yet, only the incoming relocation onto w1
        let replica = model
            .shards_of("n2")
            .into_iter()
            .find(|s| s.group == group)
            .unwrap()
            .id;
        assert!(model.would_violate_rack(replica, "n1"));
        assert!(!model.would_violate_rack(replica, "n2"));
    }

    #[test]
    fn test_rack_conflicts_detected() {
        let mut snapshot = sample();
        snapshot.nodes[1].rack = Some("A".to_string());
        let model = ClusterModel::build(&snapshot).unwrap();
        let conflicts = model.rack_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].1, "A");

        let model = ClusterModel::build(&sample()).unwrap();
        assert!(model.rack_conflicts().is_empty());
    }

    #[test]
    fn test_usage_stddev() {
        let model = ClusterModel::build(&sample()).unwrap();
        // 150, 90, 20 GB
        let mean = 260.0 / 3.0;
        let expected = (((150.0 - mean) as f64).powi(2)
            + ((90.0 - mean) as f64).powi(2)
            + ((20.0 - mean) as f64).powi(2))
            / 3.0;
        let got = model.usage_stddev("hot") / GB as f64;
        assert!((got - expected.sqrt()).abs() < 1e-6);
        assert_eq!(model.usage_stddev("cold"), 0.0);
    }
}
