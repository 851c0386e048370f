//! esbalance Rebalancer Library
//!
//! Cluster-facing half of esbalance. The rebalancer:
//! - Reads allocation, shard and node information over HTTP
//! - Fails over between the configured cluster URLs
//! - Plans swaps with `esbalance-core`
//! - Renders, validates or submits the resulting reroute commands

pub mod client;
pub mod config;
pub mod executor;
pub mod failover;
pub mod service;
pub mod snapshot;

// Re-export main types
pub use client::{ClientError, ClusterApi, ElasticClient, RelocationCommand};
pub use config::{ConfigError, RebalancerConfig};
pub use executor::{
    render_plan, ElasticRelocationSink, ExecutionMode, ExecutionReport, Executor, ExecutorConfig,
    OperationStatus, RelocationSink, RelocationSubmitError,
};
pub use failover::{BreakerConfig, EndpointFault, EndpointPool, FailoverError};
pub use service::{PlanOutcome, RebalancerService};
pub use snapshot::{assemble_snapshot, ElasticSnapshotSource, NodeAttributes, SnapshotSource};
