//! Rebalancer configuration
//!
//! Layered: defaults, then an optional TOML file, then `ESBALANCE_*` environment
//! variables. Command line flags are applied last by the binary.
//!
//! ```toml
//! urls = ["http://es-1:9200", "http://es-2:9200"]
//! box_type = "hot"
//! iterations = 10
//! shard_percentage = 90.0
//! node_percentage = 10.0
//!
//! [attributes]
//! box_type = "box_type"
//! rack = "rack_id"
//! ```

use esbalance_core::PlannerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::failover::BreakerConfig;
use crate::snapshot::NodeAttributes;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Node attribute names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
    pub box_type: String,
    pub rack: String,
}

impl Default for AttributeConfig {
    fn default() -> Self {
        let defaults = NodeAttributes::default();
        Self {
            box_type: defaults.box_type,
            rack: defaults.rack,
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub urls: Vec<String>,
    pub box_type: Option<String>,
    pub iterations: Option<usize>,
    pub shard_percentage: Option<f64>,
    pub node_percentage: Option<f64>,
}

/// Rebalancer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalancerConfig {
    /// Cluster URLs, tried in order
    pub urls: Vec<String>,

    /// Box type of the nodes to balance
    pub box_type: Option<String>,

    /// Maximum swaps per run
    pub iterations: usize,

    /// Skip shard pairs whose sizes are within this percent of each other
    pub shard_percentage: f64,

    /// Skip node pairs whose usage is within this percent of each other
    pub node_percentage: f64,

    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,

    /// Consecutive failures before an endpoint is skipped
    pub failure_threshold: u32,

    /// Seconds before a skipped endpoint is tried again
    pub recovery_timeout_secs: u64,

    pub attributes: AttributeConfig,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            box_type: None,
            iterations: 10,
            shard_percentage: 90.0,
            node_percentage: 10.0,
            request_timeout_secs: 30,
            failure_threshold: 3,
            recovery_timeout_secs: 30,
            attributes: AttributeConfig::default(),
        }
    }
}

impl RebalancerConfig {
    /// Defaults overridden by a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override settings from `ESBALANCE_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Override settings from a variable lookup
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(urls) = lookup("ESBALANCE_URLS") {
            self.urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(box_type) = lookup("ESBALANCE_BOX_TYPE") {
            self.box_type = Some(box_type);
        }
        if let Some(value) = lookup("ESBALANCE_ITERATIONS") {
            self.iterations = parse_var("ESBALANCE_ITERATIONS", &value)?;
        }
        if let Some(value) = lookup("ESBALANCE_SHARD_PERCENTAGE") {
            self.shard_percentage = parse_var("ESBALANCE_SHARD_PERCENTAGE", &value)?;
        }
        if let Some(value) = lookup("ESBALANCE_NODE_PERCENTAGE") {
            self.node_percentage = parse_var("ESBALANCE_NODE_PERCENTAGE", &value)?;
        }
        if let Some(value) = lookup("ESBALANCE_REQUEST_TIMEOUT") {
            self.request_timeout_secs = parse_var("ESBALANCE_REQUEST_TIMEOUT", &value)?;
        }
        Ok(())
    }

    /// Apply command line values; repeated URLs replace the configured list
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if !overrides.urls.is_empty() {
            self.urls = overrides.urls;
        }
        if overrides.box_type.is_some() {
            self.box_type = overrides.box_type;
        }
        if let Some(iterations) = overrides.iterations {
            self.iterations = iterations;
        }
        if let Some(pct) = overrides.shard_percentage {
            self.shard_percentage = pct;
        }
        if let Some(pct) = overrides.node_percentage {
            self.node_percentage = pct;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.urls.is_empty() {
            return Err(ConfigError::Missing("cluster url".to_string()));
        }
        match &self.box_type {
            Some(box_type) if !box_type.is_empty() => {}
            _ => return Err(ConfigError::Missing("box type".to_string())),
        }
        for (name, value) in [
            ("shard_percentage", self.shard_percentage),
            ("node_percentage", self.node_percentage),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    format!("{} is outside 0 - 100", value),
                ));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "request_timeout_secs".to_string(),
                "must be positive".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "failure_threshold".to_string(),
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Planner settings; percentages become fractions
    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            box_type: self.box_type.clone().unwrap_or_default(),
            iteration_cap: self.iterations,
            shard_pct: self.shard_percentage / 100.0,
            node_pct: self.node_percentage / 100.0,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }

    pub fn node_attributes(&self) -> NodeAttributes {
        NodeAttributes {
            box_type: self.attributes.box_type.clone(),
            rack: self.attributes.rack.clone(),
        }
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string(), value.to_string()))
}
