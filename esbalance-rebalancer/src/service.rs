//! One rebalancing run: fetch a snapshot, plan swaps, hand them to the executor

use esbalance_core::{BalanceError, ClusterModel, Planner, PlannerConfig, SwapPlan};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::executor::{ExecutionReport, Executor};
use crate::snapshot::SnapshotSource;

/// Result of the planning half of a run
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Plan(SwapPlan),
    /// No node carries the requested box type; nothing to do
    NoEligibleNodes(String),
}

/// Snapshot source, planner and executor wired together
pub struct RebalancerService {
    source: Arc<dyn SnapshotSource>,
    planner: Planner,
    executor: Arc<Executor>,
}

impl RebalancerService {
    pub fn new(source: Arc<dyn SnapshotSource>, planner: PlannerConfig, executor: Arc<Executor>) -> Self {
        Self {
            source,
            planner: Planner::new(planner),
            executor,
        }
    }

    /// Fetch a snapshot and plan swaps for it
    #[instrument(skip(self), fields(box_type = %self.planner.config().box_type))]
    pub async fn plan(&self) -> Result<PlanOutcome, BalanceError> {
        let box_type = self.planner.config().box_type.clone();
        let snapshot = self.source.fetch(&box_type).await?;
        let model = ClusterModel::build(&snapshot)?;

        match self.planner.plan(&model) {
            Ok(plan) => Ok(PlanOutcome::Plan(plan)),
            Err(BalanceError::NoEligibleNodes(box_type)) => {
                warn!(box_type = %box_type, "No nodes with this box type, nothing to balance");
                Ok(PlanOutcome::NoEligibleNodes(box_type))
            }
            Err(e) => Err(e),
        }
    }

    /// Submit (or render) a plan
    pub async fn execute(&self, plan: &SwapPlan) -> ExecutionReport {
        let report = self.executor.execute(plan).await;
        if report.skipped() > 0 {
            info!(skipped = report.skipped(), "Run interrupted before the plan finished");
        }
        report
    }
}
