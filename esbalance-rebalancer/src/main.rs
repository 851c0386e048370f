//! esbalance
//!
//! Disk-usage based rebalancing for Elasticsearch. Swaps large shards on full nodes
//! with small shards on empty ones, never putting two copies of a shard in one rack.
//!
//! One set of swaps is planned per run and the cluster carries them out
//! asynchronously, so several runs may be needed to fully balance a cluster.
//!
//! Example:
//!   esbalance -u localhost:9200 --box-type hot --iterations 50

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use esbalance_rebalancer::config::Overrides;
use esbalance_rebalancer::{
    render_plan, BreakerConfig, ClusterApi, ElasticClient, ElasticRelocationSink,
    ElasticSnapshotSource, EndpointPool, ExecutionMode, Executor, ExecutorConfig, PlanOutcome,
    RebalancerConfig, RebalancerService,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "esbalance")]
#[command(about = "Disk-usage based shard rebalancing for Elasticsearch")]
#[command(version)]
struct Cli {
    /// Cluster URL; repeat for failover
    #[arg(short = 'u', long = "url")]
    urls: Vec<String>,

    /// Box type of the nodes to rebalance (e.g. hot, warm)
    #[arg(short, long)]
    box_type: Option<String>,

    /// Maximum number of swaps [default: 10]
    #[arg(short, long)]
    iterations: Option<usize>,

    /// Don't swap shards whose sizes are within this percent of each other [default: 90]
    #[arg(short = 'p', long)]
    shard_percentage: Option<f64>,

    /// Don't swap between nodes whose usage is within this percent of each other [default: 10]
    #[arg(short = 'P', long)]
    node_percentage: Option<f64>,

    /// Print debug logs
    #[arg(short, long)]
    verbose: bool,

    /// Submit the plan; without this flag the run is a dry run
    #[arg(long, conflicts_with = "validate")]
    execute: bool,

    /// Submit the plan with the cluster's dry_run flag so it is checked but not applied
    #[arg(long)]
    validate: bool,

    /// TOML config file
    #[arg(short, long, env = "ESBALANCE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format for the plan and report
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

fn load_config(cli: &Cli) -> Result<RebalancerConfig> {
    let mut config = match &cli.config {
        Some(path) => RebalancerConfig::load(path)?,
        None => RebalancerConfig::default(),
    };
    config.apply_env()?;
    config.apply_overrides(Overrides {
        urls: cli.urls.clone(),
        box_type: cli.box_type.clone(),
        iterations: cli.iterations,
        shard_percentage: cli.shard_percentage,
        node_percentage: cli.node_percentage,
    });
    config.validate()?;
    Ok(config)
}

fn build_pool(config: &RebalancerConfig) -> Result<Arc<EndpointPool<dyn ClusterApi>>> {
    let mut endpoints: Vec<(String, Arc<dyn ClusterApi>)> = Vec::with_capacity(config.urls.len());
    for url in &config.urls {
        let client = ElasticClient::new(url, config.request_timeout())
            .with_context(|| format!("Failed to create HTTP client for {}", url))?;
        let url = client.base_url().to_string();
        let client: Arc<dyn ClusterApi> = Arc::new(client);
        endpoints.push((url, client));
    }
    let breaker: BreakerConfig = config.breaker_config();
    Ok(Arc::new(EndpointPool::new(endpoints, breaker)?))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the plan
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli).context("Invalid configuration")?;
    let mode = ExecutionMode::from_flags(cli.execute, cli.validate);

    info!(
        urls = ?config.urls,
        box_type = ?config.box_type,
        iterations = config.iterations,
        shard_percentage = config.shard_percentage,
        node_percentage = config.node_percentage,
        mode = %mode,
        "Starting esbalance"
    );

    let pool = build_pool(&config)?;
    let source = Arc::new(ElasticSnapshotSource::new(pool.clone(), config.node_attributes()));
    let sink = Arc::new(ElasticRelocationSink::new(pool.clone()));
    let executor = Arc::new(Executor::new(
        ExecutorConfig {
            mode,
            operation_timeout: config.request_timeout() * config.urls.len() as u32,
        },
        sink,
    ));

    let shutdown = executor.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.shutdown().await;
        }
    });

    let service = RebalancerService::new(source, config.planner_config(), executor);

    let plan = match service.plan().await.context("Planning failed")? {
        PlanOutcome::Plan(plan) => plan,
        PlanOutcome::NoEligibleNodes(box_type) => {
            match cli.format {
                OutputFormat::Text => println!("No nodes with box type '{}'", box_type),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "box_type": box_type, "eligible_nodes": 0 })
                ),
            }
            return Ok(ExitCode::SUCCESS);
        }
    };

    if cli.format == OutputFormat::Text {
        print!("{}", render_plan(&plan));
    }

    let report = service.execute(&plan).await;

    match cli.format {
        OutputFormat::Text => println!("{}", report.summary()),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "plan": plan, "report": report }))
                .context("Failed to serialize plan")?
        ),
    }

    if mode == ExecutionMode::DryRun && !plan.is_empty() {
        warn!("Finished dry run. Use `--execute` to run for real");
    }

    if report.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
