//! Elasticsearch Client
//!
//! HTTP client for the handful of cluster APIs the rebalancer needs:
//! `_cat/allocation`, `_cat/shards`, `_nodes` and `_cluster/reroute`.

use async_trait::async_trait;
use esbalance_core::ShardMove;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::failover::EndpointFault;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl EndpointFault for ClientError {
    /// Transport errors and 5xx; a 4xx or an undecodable body is the cluster's answer
    fn is_endpoint_fault(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Decode { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// One row of `_cat/allocation?format=json&bytes=b`
///
/// The cat APIs return numbers as strings, and `null` for the UNASSIGNED row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationRow {
    pub node: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub shards: Option<String>,
    #[serde(rename = "disk.total", default)]
    pub disk_total: Option<String>,
}

/// One row of `_cat/shards?format=json&bytes=b`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardRow {
    pub index: String,
    pub shard: String,
    pub prirep: String,
    pub state: String,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    /// Host name, or `"from -> ip id to"` while relocating
    #[serde(default)]
    pub node: Option<String>,
}

/// Response of `_nodes`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodesInfo {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeInfoEntry>,
}

/// A node of `_nodes`, keyed by node id in [`NodesInfo`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfoEntry {
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    /// Custom node attributes (`node.attr.*`)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// A `_cluster/reroute` command
///
/// Serializes as `{"move": {"index": .., "shard": .., "from_node": .., "to_node": ..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocationCommand {
    Move {
        index: String,
        shard: u32,
        from_node: String,
        to_node: String,
    },
}

impl From<&ShardMove> for RelocationCommand {
    fn from(relocation: &ShardMove) -> Self {
        Self::Move {
            index: relocation.index.clone(),
            shard: relocation.number,
            from_node: relocation.from_node.clone(),
            to_node: relocation.to_node.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RerouteRequest<'a> {
    commands: &'a [RelocationCommand],
}

/// Response of `_cluster/reroute`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerouteResponse {
    #[serde(default)]
    pub acknowledged: bool,
}

/// Cluster APIs used by the snapshot source and the relocation sink
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Disk allocation per node
    async fn cat_allocation(&self) -> Result<Vec<AllocationRow>>;

    /// Every shard copy with its state, size and host
    async fn cat_shards(&self) -> Result<Vec<ShardRow>>;

    /// Node names and attributes
    async fn nodes_info(&self) -> Result<NodesInfo>;

    /// Submit relocation commands; with `dry_run` the cluster only validates them
    async fn reroute(&self, commands: &[RelocationCommand], dry_run: bool) -> Result<RerouteResponse>;
}

/// reqwest-backed [`ClusterApi`] for one cluster URL
pub struct ElasticClient {
    client: Client,
    base_url: String,
}

impl ElasticClient {
    /// Create a client for `base_url`; `host:port` without a scheme is treated as http
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: normalize_url(base_url),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, "GET");
        let response = check_status(self.client.get(&url).send().await?).await?;
        decode(path, response).await
    }
}

#[async_trait]
impl ClusterApi for ElasticClient {
    #[instrument(skip(self), fields(url = %self.base_url))]
    async fn cat_allocation(&self) -> Result<Vec<AllocationRow>> {
        self.get_json("_cat/allocation?format=json&bytes=b").await
    }

    #[instrument(skip(self), fields(url = %self.base_url))]
    async fn cat_shards(&self) -> Result<Vec<ShardRow>> {
        self.get_json("_cat/shards?format=json&bytes=b").await
    }

    #[instrument(skip(self), fields(url = %self.base_url))]
    async fn nodes_info(&self) -> Result<NodesInfo> {
        self.get_json("_nodes").await
    }

    #[instrument(skip(self, commands), fields(url = %self.base_url, commands = commands.len()))]
    async fn reroute(&self, commands: &[RelocationCommand], dry_run: bool) -> Result<RerouteResponse> {
        let path = format!("_cluster/reroute?dry_run={}", dry_run);
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&RerouteRequest { commands })
            .send()
            .await?;
        let response = check_status(response).await?;
        decode(&path, response).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ClientError::Api {
            status: response.status().as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> Result<T> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| ClientError::Decode {
        endpoint: path.to_string(),
        message: e.to_string(),
    })
}

/// Trim trailing slashes and default to http
pub fn normalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}
