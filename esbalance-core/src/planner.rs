//! Balance Planner
//!
//! Builds a swap plan for one box type from a cluster model.
//! Each step:
//! - Picks the most and least used node pair still worth working on
//! - Exchanges a large shard on the full node with a small one on the empty node
//! - Applies the exchange to a simulated copy of the model before the next step
//!
//! Swaps never put two copies of a shard group in one rack, and each one strictly
//! narrows the gap between its two nodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, instrument};

use crate::error::{BalanceError, Result};
use crate::format_bytes;
use crate::model::{ClusterModel, Shard, ShardGroup, ShardId};
use crate::rules;
use crate::snapshot::ShardRole;

/// One half of a swap: a shard copy leaving one node for another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMove {
    pub shard: ShardId,
    pub index: String,
    pub number: u32,
    pub role: ShardRole,
    /// Size in bytes
    pub size: u64,
    pub from_node: String,
    pub to_node: String,
}

impl ShardMove {
    fn new(shard: &Shard, to_node: &str) -> Self {
        Self {
            shard: shard.id,
            index: shard.group.index.clone(),
            number: shard.group.shard,
            role: shard.role,
            size: shard.size,
            from_node: shard.node.clone(),
            to_node: to_node.to_string(),
        }
    }

    pub fn group(&self) -> ShardGroup {
        ShardGroup {
            index: self.index.clone(),
            shard: self.number,
        }
    }

    /// `index/shard/p` style label
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.index, self.number, self.role.letter())
    }
}

/// Exchange of a large shard on `source_node` with a smaller one on `target_node`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapOperation {
    /// Fuller node of the pair
    pub source_node: String,
    /// Emptier node of the pair
    pub target_node: String,
    /// Larger shard, moving source -> target
    pub outgoing: ShardMove,
    /// Smaller shard, moving target -> source
    pub incoming: ShardMove,
    /// Node usage gap ratio when the swap was accepted
    pub gap_ratio: f64,
    /// Relative size difference of the two shards
    pub size_ratio: f64,
}

impl SwapOperation {
    /// Both relocations, larger shard first
    pub fn moves(&self) -> [&ShardMove; 2] {
        [&self.outgoing, &self.incoming]
    }

    /// Bytes shifted from the source node to the target node
    pub fn delta(&self) -> u64 {
        self.outgoing.size.saturating_sub(self.incoming.size)
    }
}

impl fmt::Display for SwapOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) on {} <-> {} ({}) on {}",
            self.outgoing.label(),
            format_bytes(self.outgoing.size),
            self.source_node,
            self.incoming.label(),
            format_bytes(self.incoming.size),
            self.target_node
        )
    }
}

/// Why planning ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Plan reached the iteration cap
    IterationCap,
    /// Largest node gap is below the node threshold
    Balanced,
    /// No node pair has a valid shard exchange left
    NoCandidates,
    /// Fewer than two nodes of the box type
    TooFewNodes,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::IterationCap => "iteration cap reached",
            Self::Balanced => "nodes within threshold",
            Self::NoCandidates => "no valid exchange left",
            Self::TooFewNodes => "fewer than two nodes",
        };
        f.write_str(text)
    }
}

/// Ordered swaps produced by one planning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapPlan {
    pub box_type: String,
    pub operations: Vec<SwapOperation>,
    pub stop_reason: StopReason,
    /// Usage standard deviation across the box type before planning, in bytes
    pub stddev_before: f64,
    /// Same, after simulated application of every operation
    pub stddev_after: f64,
}

impl SwapPlan {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Total bytes relocated, counting both halves of each swap
    pub fn bytes_relocated(&self) -> u64 {
        self.operations
            .iter()
            .map(|op| op.outgoing.size + op.incoming.size)
            .sum()
    }

    /// Apply every operation to a model, in order
    pub fn apply_to(&self, model: &mut ClusterModel) -> Result<()> {
        for op in &self.operations {
            model.apply_swap(op)?;
        }
        Ok(())
    }

    /// Summary of the plan
    pub fn summary(&self) -> String {
        format!(
            "{} swaps for box type '{}', {} relocated, usage stddev {} -> {} ({})",
            self.operations.len(),
            self.box_type,
            format_bytes(self.bytes_relocated()),
            format_bytes(self.stddev_before as u64),
            format_bytes(self.stddev_after as u64),
            self.stop_reason
        )
    }
}

/// Planner configuration
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Box type whose nodes are balanced
    pub box_type: String,
    /// Maximum swaps per plan
    pub iteration_cap: usize,
    /// Minimum relative size difference of exchanged shards (0.0 - 1.0)
    pub shard_pct: f64,
    /// Minimum relative usage gap between exchanging nodes (0.0 - 1.0)
    pub node_pct: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            box_type: "hot".to_string(),
            iteration_cap: 10,
            shard_pct: 0.9,
            node_pct: 0.1,
        }
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.box_type.is_empty() {
            return Err(BalanceError::InvalidParameter {
                name: "box_type",
                reason: "must not be empty".to_string(),
            });
        }
        for (name, value) in [("shard_pct", self.shard_pct), ("node_pct", self.node_pct)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(BalanceError::InvalidParameter {
                    name,
                    reason: format!("{} is outside 0.0 - 1.0", value),
                });
            }
        }
        Ok(())
    }
}

/// Swap planner
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    /// Create a new planner
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan swaps against a simulated copy of `model`
    #[instrument(skip(self, model), fields(box_type = %self.config.box_type))]
    pub fn plan(&self, model: &ClusterModel) -> Result<SwapPlan> {
        self.config.validate()?;
        let box_type = self.config.box_type.as_str();

        let eligible: Vec<String> = model.nodes_of(box_type).map(|n| n.id.clone()).collect();
        if eligible.is_empty() {
            return Err(BalanceError::NoEligibleNodes(box_type.to_string()));
        }

        info!(
            nodes = eligible.len(),
            iteration_cap = self.config.iteration_cap,
            shard_pct = self.config.shard_pct,
            node_pct = self.config.node_pct,
            "Planning swaps"
        );

        let mut sim = model.clone();
        let stddev_before = sim.usage_stddev(box_type);
        let mut operations = Vec::new();
        let mut moved: BTreeSet<ShardGroup> = BTreeSet::new();
        let mut exhausted: BTreeSet<(String, String)> = BTreeSet::new();

        let stop_reason = if eligible.len() < 2 {
            StopReason::TooFewNodes
        } else {
            loop {
                if operations.len() >= self.config.iteration_cap {
                    break StopReason::IterationCap;
                }

                let ranked = rank_by_usage(&sim, &eligible);
                let (most, least) = (&ranked[0], &ranked[ranked.len() - 1]);
                if !rules::meets_node_threshold(most.1, least.1, self.config.node_pct) {
                    debug!(
                        most = %most.0,
                        least = %least.0,
                        gap_ratio = rules::gap_ratio(most.1, least.1),
                        "Largest gap below node threshold"
                    );
                    break StopReason::Balanced;
                }

                match self.find_swap(&sim, &ranked, &moved, &mut exhausted) {
                    Some(op) => {
                        sim.apply_swap(&op)?;
                        moved.insert(op.outgoing.group());
                        moved.insert(op.incoming.group());
                        operations.push(op);
                    }
                    None => break StopReason::NoCandidates,
                }
            }
        };

        let plan = SwapPlan {
            box_type: box_type.to_string(),
            operations,
            stop_reason,
            stddev_before,
            stddev_after: sim.usage_stddev(box_type),
        };

        info!(summary = %plan.summary(), "Swap plan created");

        Ok(plan)
    }

    /// Walk node pairs from the most extreme inward and return the first valid swap
    fn find_swap(
        &self,
        sim: &ClusterModel,
        ranked: &[(String, u64)],
        moved: &BTreeSet<ShardGroup>,
        exhausted: &mut BTreeSet<(String, String)>,
    ) -> Option<SwapOperation> {
        for (i, (source, source_usage)) in ranked.iter().enumerate() {
            for (target, target_usage) in ranked[i + 1..].iter().rev() {
                // targets only get fuller from here on
                if !rules::meets_node_threshold(*source_usage, *target_usage, self.config.node_pct)
                {
                    break;
                }

                let pair = (source.clone(), target.clone());
                if exhausted.contains(&pair) {
                    continue;
                }

                if let Some(op) = self.scan_pair(sim, source, target, moved) {
                    return Some(op);
                }

                debug!(source = %source, target = %target, "Node pair exhausted");
                exhausted.insert(pair);
            }
        }
        None
    }

    /// First valid (large on source, small on target) shard pair for one node pair
    fn scan_pair(
        &self,
        sim: &ClusterModel,
        source: &str,
        target: &str,
        moved: &BTreeSet<ShardGroup>,
    ) -> Option<SwapOperation> {
        let source_node = sim.node(source)?;
        let target_node = sim.node(target)?;
        let gap = source_node.usage.saturating_sub(target_node.usage);

        let candidate = |shard: &&Shard| shard.is_movable() && !moved.contains(&shard.group);

        let outgoing: Vec<&Shard> = sim.shards_of(source).into_iter().filter(candidate).collect();
        let mut incoming: Vec<&Shard> = sim.shards_of(target).into_iter().filter(candidate).collect();
        incoming.sort_by(|a, b| {
            a.size
                .cmp(&b.size)
                .then_with(|| a.group.cmp(&b.group))
                .then(a.role.cmp(&b.role))
                .then(a.id.cmp(&b.id))
        });

        for large in &outgoing {
            for small in &incoming {
                if small.size >= large.size {
                    break;
                }
                if !rules::meets_shard_threshold(large.size, small.size, self.config.shard_pct) {
                    debug!(
                        large = %large.label(),
                        large_size = %format_bytes(large.size),
                        small = %small.label(),
                        small_size = %format_bytes(small.size),
                        "Not worth swapping"
                    );
                    break;
                }
                if !rules::reduces_gap(large.size, small.size, gap) {
                    continue;
                }
                if !rules::fits_capacity(target_node.usage, small.size, large.size, target_node.capacity)
                    || !rules::fits_capacity(source_node.usage, large.size, small.size, source_node.capacity)
                {
                    debug!(
                        large = %large.label(),
                        small = %small.label(),
                        "Swap would overfill a node"
                    );
                    continue;
                }
                if sim.would_violate_rack(large.id, target) {
                    debug!(shard = %large.label(), node = %target, "Rack conflict");
                    continue;
                }
                if sim.would_violate_rack(small.id, source) {
                    debug!(shard = %small.label(), node = %source, "Rack conflict");
                    continue;
                }

                let op = SwapOperation {
                    source_node: source.to_string(),
                    target_node: target.to_string(),
                    outgoing: ShardMove::new(large, target),
                    incoming: ShardMove::new(small, source),
                    gap_ratio: rules::gap_ratio(source_node.usage, target_node.usage),
                    size_ratio: rules::size_ratio(large.size, small.size),
                };

                info!(
                    large = %large.label(),
                    large_size = %format_bytes(large.size),
                    source = %source,
                    source_usage = %format_bytes(source_node.usage),
                    small = %small.label(),
                    small_size = %format_bytes(small.size),
                    target = %target,
                    target_usage = %format_bytes(target_node.usage),
                    "Exchanging shards"
                );

                return Some(op);
            }
        }
        None
    }
}

/// Nodes by usage, most used first, ties by identifier
fn rank_by_usage(model: &ClusterModel, nodes: &[String]) -> Vec<(String, u64)> {
    let mut ranked: Vec<(String, u64)> = nodes
        .iter()
        .map(|id| (id.clone(), model.usage(id)))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Plan swaps for `box_type` with the given bounds
pub fn plan(
    model: &ClusterModel,
    box_type: &str,
    iteration_cap: usize,
    shard_pct: f64,
    node_pct: f64,
) -> Result<SwapPlan> {
    Planner::new(PlannerConfig {
        box_type: box_type.to_string(),
        iteration_cap,
        shard_pct,
        node_pct,
    })
    .plan(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ClusterSnapshot, NodeRecord, ShardRecord, ShardState};

    const GB: u64 = 1024 * 1024 * 1024;

    fn make_node(name: &str, rack: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            ip: None,
            rack: Some(rack.to_string()),
            box_type: Some("hot".to_string()),
            disk_total: None,
        }
    }

    fn make_shard(index: &str, role: ShardRole, gb: u64, node: &str) -> ShardRecord {
        ShardRecord {
            index: index.to_string(),
            shard: 0,
            role,
            state: ShardState::Started,
            store: Some(gb * GB),
            node: node.to_string(),
            relocating_to: None,
        }
    }

    fn config(cap: usize, shard_pct: f64, node_pct: f64) -> PlannerConfig {
        PlannerConfig {
            box_type: "hot".to_string(),
            iteration_cap: cap,
            shard_pct,
            node_pct,
        }
    }

    fn two_nodes() -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: vec![make_node("n1", "A"), make_node("n2", "B")],
            shards: vec![
                make_shard("a", ShardRole::Primary, 100, "n1"),
                make_shard("b", ShardRole::Primary, 60, "n1"),
                make_shard("c", ShardRole::Primary, 10, "n2"),
            ],
        }
    }

    #[test]
    fn test_planner_config_default() {
        let config = PlannerConfig::default();
        assert_eq!(config.iteration_cap, 10);
        assert_eq!(config.shard_pct, 0.9);
        assert_eq!(config.node_pct, 0.1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let model = ClusterModel::build(&two_nodes()).unwrap();
        let err = Planner::new(config(5, 1.5, 0.1)).plan(&model).unwrap_err();
        assert!(matches!(err, BalanceError::InvalidParameter { name: "shard_pct", .. }));
        let err = Planner::new(config(5, 0.1, f64::NAN)).plan(&model).unwrap_err();
        assert!(matches!(err, BalanceError::InvalidParameter { name: "node_pct", .. }));
    }

    #[test]
    fn test_no_eligible_nodes() {
        let model = ClusterModel::build(&two_nodes()).unwrap();
        let err = plan(&model, "warm", 5, 0.1, 0.1).unwrap_err();
        assert_eq!(err, BalanceError::NoEligibleNodes("warm".to_string()));
    }

    #[test]
    fn test_single_node_gives_empty_plan() {
        let snapshot = ClusterSnapshot {
            nodes: vec![make_node("n1", "A")],
            shards: vec![make_shard("a", ShardRole::Primary, 100, "n1")],
        };
        let model = ClusterModel::build(&snapshot).unwrap();
        let plan = plan(&model, "hot", 5, 0.1, 0.1).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.stop_reason, StopReason::TooFewNodes);
    }

    #[test]
    fn test_basic_swap() {
        let model = ClusterModel::build(&two_nodes()).unwrap();
        let plan = Planner::new(config(5, 0.1, 0.1)).plan(&model).unwrap();

        // gap is 150 GB; 100 <-> 10 shifts 90 GB which fits, and afterwards
        // n1 = 70, n2 = 100 so n2 becomes the source
        assert!(!plan.is_empty());
        let first = &plan.operations[0];
        assert_eq!(first.source_node, "n1");
        assert_eq!(first.target_node, "n2");
        assert_eq!(first.outgoing.label(), "a/0/p");
        assert_eq!(first.incoming.label(), "c/0/p");
        assert_eq!(first.outgoing.to_node, "n2");
        assert_eq!(first.incoming.to_node, "n1");
        assert!(plan.stddev_after < plan.stddev_before);
    }

    #[test]
    fn test_swap_must_not_overshoot_gap() {
        // gap is 20 GB, any exchange shifts at least 40 GB
        let snapshot = ClusterSnapshot {
            nodes: vec![make_node("n1", "A"), make_node("n2", "B")],
            shards: vec![
                make_shard("a", ShardRole::Primary, 50, "n1"),
                make_shard("b", ShardRole::Primary, 10, "n2"),
                make_shard("c", ShardRole::Primary, 20, "n2"),
            ],
        };
        let model = ClusterModel::build(&snapshot).unwrap();
        let plan = plan(&model, "hot", 5, 0.1, 0.1).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.stop_reason, StopReason::NoCandidates);
    }

    #[test]
    fn test_shard_threshold_blocks_similar_shards() {
        let snapshot = ClusterSnapshot {
            nodes: vec![make_node("n1", "A"), make_node("n2", "B")],
            shards: vec![
                make_shard("a", ShardRole::Primary, 100, "n1"),
                make_shard("b", ShardRole::Primary, 100, "n1"),
                make_shard("c", ShardRole::Primary, 95, "n2"),
            ],
        };
        let model = ClusterModel::build(&snapshot).unwrap();
        let plan = plan(&model, "hot", 5, 0.1, 0.1).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_balanced_cluster_stops_immediately() {
        let snapshot = ClusterSnapshot {
            nodes: vec![make_node("n1", "A"), make_node("n2", "B")],
            shards: vec![
                make_shard("a", ShardRole::Primary, 100, "n1"),
                make_shard("b", ShardRole::Primary, 95, "n2"),
            ],
        };
        let model = ClusterModel::build(&snapshot).unwrap();
        let plan = plan(&model, "hot", 5, 0.0, 0.1).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.stop_reason, StopReason::Balanced);
    }

    #[test]
    fn test_rack_conflict_skips_candidate() {
        // a's replica lives on rack B, so a may not land on n2
        let snapshot = ClusterSnapshot {
            nodes: vec![
                make_node("n1", "A"),
                make_node("n2", "B"),
                make_node("n3", "B"),
            ],
            shards: vec![
                make_shard("a", ShardRole::Primary, 100, "n1"),
                make_shard("a", ShardRole::Replica, 100, "n3"),
                make_shard("z", ShardRole::Primary, 5, "n2"),
            ],
        };
        let model = ClusterModel::build(&snapshot).unwrap();
        let plan = plan(&model, "hot", 5, 0.1, 0.1).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_immovable_shards_are_skipped() {
        let mut snapshot = two_nodes();
        snapshot.shards[0].state = ShardState::Initializing;
        snapshot.shards[1].state = ShardState::Initializing;
        let model = ClusterModel::build(&snapshot).unwrap();
        let plan = plan(&model, "hot", 5, 0.1, 0.1).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_capacity_limits_swap() {
        let mut snapshot = two_nodes();
        // n2 holds 10 GB on a 50 GB disk, so it cannot take the 100 GB shard or the 60 GB one
        snapshot.nodes[1].disk_total = Some(50 * GB);
        let model = ClusterModel::build(&snapshot).unwrap();
        let plan = plan(&model, "hot", 5, 0.1, 0.1).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_iteration_cap_zero() {
        let model = ClusterModel::build(&two_nodes()).unwrap();
        let plan = plan(&model, "hot", 0, 0.1, 0.1).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.stop_reason, StopReason::IterationCap);
    }

    #[test]
    fn test_group_moved_once_per_run() {
        let model = ClusterModel::build(&two_nodes()).unwrap();
        let plan = plan(&model, "hot", 10, 0.1, 0.0).unwrap();
        let mut groups = BTreeSet::new();
        for op in &plan.operations {
            assert!(groups.insert(op.outgoing.group()));
            assert!(groups.insert(op.incoming.group()));
        }
    }

    #[test]
    fn test_plan_does_not_touch_input_model() {
        let model = ClusterModel::build(&two_nodes()).unwrap();
        let before = model.usage("n1");
        let plan = plan(&model, "hot", 5, 0.1, 0.1).unwrap();
        assert!(!plan.is_empty());
        assert_eq!(model.usage("n1"), before);

        let mut applied = model.clone();
        plan.apply_to(&mut applied).unwrap();
        assert!(applied.usage_stddev("hot") <= model.usage_stddev("hot"));
        // applying twice fails since the shards already moved
        assert!(matches!(
            plan.apply_to(&mut applied),
            Err(BalanceError::StaleSwap(_))
        ));
    }

    #[test]
    fn test_plan_serializes() {
        let model = ClusterModel::build(&two_nodes()).unwrap();
        let plan = plan(&model, "hot", 5, 0.1, 0.1).unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["box_type"], "hot");
        assert_eq!(json["operations"][0]["outgoing"]["role"], "primary");
        assert!(json["stop_reason"].is_string());
    }
}
