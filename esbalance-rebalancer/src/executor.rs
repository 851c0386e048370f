//! Plan Executor
//!
//! Submits swap plans to the cluster:
//! - One reroute request per swap, carrying both move commands
//! - Operations go out one at a time, in plan order
//! - A failed operation is recorded and the next one still runs
//! - Interrupting stops submission; the rest of the plan is reported as skipped

use async_trait::async_trait;
use esbalance_core::{format_bytes, SwapOperation, SwapPlan};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use crate::client::{ClusterApi, RelocationCommand};
use crate::failover::EndpointPool;

/// Errors submitting one swap
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum RelocationSubmitError {
    #[error("Reroute failed: {0}")]
    Failed(String),

    #[error("Reroute not acknowledged by the cluster")]
    NotAcknowledged,

    #[error("Timeout submitting reroute")]
    Timeout,
}

/// What the executor does with a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Render the plan only; nothing reaches the cluster
    DryRun,
    /// Send each swap with the cluster's own dry-run flag so it is checked but not applied
    Validate,
    /// Send each swap for real
    Execute,
}

impl ExecutionMode {
    pub fn from_flags(execute: bool, validate: bool) -> Self {
        match (execute, validate) {
            (true, _) => Self::Execute,
            (false, true) => Self::Validate,
            (false, false) => Self::DryRun,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::DryRun => "dry run",
            Self::Validate => "validate",
            Self::Execute => "execute",
        };
        f.write_str(text)
    }
}

/// Destination for relocation commands
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelocationSink: Send + Sync {
    /// Submit one batch of commands; `dry_run` asks the cluster to validate only
    async fn submit(
        &self,
        commands: &[RelocationCommand],
        dry_run: bool,
    ) -> Result<(), RelocationSubmitError>;
}

/// Sink posting to `_cluster/reroute` through the endpoint pool
pub struct ElasticRelocationSink {
    pool: Arc<EndpointPool<dyn ClusterApi>>,
}

impl ElasticRelocationSink {
    pub fn new(pool: Arc<EndpointPool<dyn ClusterApi>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelocationSink for ElasticRelocationSink {
    async fn submit(
        &self,
        commands: &[RelocationCommand],
        dry_run: bool,
    ) -> Result<(), RelocationSubmitError> {
        let commands: Arc<[RelocationCommand]> = Arc::from(commands);
        let response = self
            .pool
            .call("cluster reroute", |api| {
                let commands = commands.clone();
                async move { api.reroute(&commands, dry_run).await }
            })
            .await
            .map_err(|e| RelocationSubmitError::Failed(e.to_string()))?;

        if response.acknowledged {
            Ok(())
        } else {
            Err(RelocationSubmitError::NotAcknowledged)
        }
    }
}

/// Outcome of one swap
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum OperationStatus {
    /// Rendered only (dry run)
    Rendered,
    /// Accepted by the cluster
    Submitted,
    Failed(RelocationSubmitError),
    /// Not attempted because of shutdown
    Skipped,
}

/// Result of one swap of the plan
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    /// Position in the plan, from 1
    pub position: usize,
    pub operation: SwapOperation,
    #[serde(flatten)]
    pub status: OperationStatus,
    pub duration: Duration,
}

/// Overall execution result
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub mode: ExecutionMode,
    pub results: Vec<OperationResult>,
    pub duration: Duration,
}

impl ExecutionReport {
    fn count(&self, wanted: fn(&OperationStatus) -> bool) -> usize {
        self.results.iter().filter(|r| wanted(&r.status)).count()
    }

    pub fn submitted(&self) -> usize {
        self.count(|s| matches!(s, OperationStatus::Submitted))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, OperationStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, OperationStatus::Skipped))
    }

    pub fn rendered(&self) -> usize {
        self.count(|s| matches!(s, OperationStatus::Rendered))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    /// Success rate of attempted submissions as percentage
    pub fn success_rate(&self) -> f64 {
        let attempted = self.submitted() + self.failed();
        if attempted == 0 {
            100.0
        } else {
            (self.submitted() as f64 / attempted as f64) * 100.0
        }
    }

    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{}: {} submitted, {} failed, {} skipped, {} rendered in {:?} ({:.1}% success rate)",
            self.mode,
            self.submitted(),
            self.failed(),
            self.skipped(),
            self.rendered(),
            self.duration,
            self.success_rate()
        )
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub mode: ExecutionMode,
    /// Limit for one reroute submission, failover included
    pub operation_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::DryRun,
            operation_timeout: Duration::from_secs(60),
        }
    }
}

/// Swap plan executor
pub struct Executor {
    config: ExecutorConfig,
    sink: Arc<dyn RelocationSink>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl Executor {
    /// Create a new executor
    pub fn new(config: ExecutorConfig, sink: Arc<dyn RelocationSink>) -> Self {
        Self {
            config,
            sink,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    /// Execute a swap plan
    #[instrument(skip(self, plan), fields(mode = %self.config.mode, operations = plan.len()))]
    pub async fn execute(&self, plan: &SwapPlan) -> ExecutionReport {
        let start = Instant::now();
        let mut report = ExecutionReport {
            mode: self.config.mode,
            results: Vec::with_capacity(plan.len()),
            duration: Duration::ZERO,
        };

        if plan.is_empty() {
            info!("No swaps to execute");
            return report;
        }

        for (i, operation) in plan.operations.iter().enumerate() {
            let started = Instant::now();
            let status = if *self.shutdown.read().await {
                OperationStatus::Skipped
            } else {
                self.execute_operation(i + 1, operation).await
            };

            report.results.push(OperationResult {
                position: i + 1,
                operation: operation.clone(),
                status,
                duration: started.elapsed(),
            });
        }

        report.duration = start.elapsed();
        info!(summary = %report.summary(), "Plan execution complete");

        report
    }

    async fn execute_operation(&self, position: usize, operation: &SwapOperation) -> OperationStatus {
        if self.config.mode == ExecutionMode::DryRun {
            info!(position, swap = %operation, "Would swap");
            return OperationStatus::Rendered;
        }

        let commands = operation.moves().map(RelocationCommand::from);
        let dry_run = self.config.mode == ExecutionMode::Validate;

        match timeout(self.config.operation_timeout, self.sink.submit(&commands, dry_run)).await {
            Ok(Ok(())) => {
                info!(position, swap = %operation, dry_run, "Swap submitted");
                OperationStatus::Submitted
            }
            Ok(Err(e)) => {
                error!(position, swap = %operation, error = %e, "Swap failed");
                OperationStatus::Failed(e)
            }
            Err(_) => {
                error!(position, swap = %operation, "Swap timed out");
                OperationStatus::Failed(RelocationSubmitError::Timeout)
            }
        }
    }

    /// Stop submitting; remaining operations are skipped
    pub async fn shutdown(&self) {
        let mut shutdown = self.shutdown.write().await;
        *shutdown = true;
        warn!("Executor shutdown requested");
    }
}

/// Plain-text rendering of a plan, one numbered line per swap
pub fn render_plan(plan: &SwapPlan) -> String {
    let mut out = format!(
        "{} {}\n",
        console::style(format!("Swap plan for box type '{}':", plan.box_type)).bold(),
        console::style(format!("{} swaps", plan.len())).cyan()
    );

    for (i, operation) in plan.operations.iter().enumerate() {
        out.push_str(&format!(
            "  {:>3}. {} (shifts {}, gap {:.1}%, size difference {:.1}%)\n",
            i + 1,
            operation,
            format_bytes(operation.delta()),
            operation.gap_ratio * 100.0,
            operation.size_ratio * 100.0
        ));
    }

    out.push_str(&format!(
        "  relocating {}, usage stddev {} -> {}, stopped: {}\n",
        format_bytes(plan.bytes_relocated()),
        format_bytes(plan.stddev_before as u64),
        format_bytes(plan.stddev_after as u64),
        plan.stop_reason
    ));
    out
}
