//! Read-only search-engine HTTP client

use crate::error::{HiveError, Result};
use crate::search::{ClusterHealth, IndexSize, JvmStat, SearchStatus, ThreadPoolStat};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Pools the monitor reports on
pub const WATCHED_POOLS: &[&str] = &["search", "write", "get"];

#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn cluster_health(&self) -> Result<ClusterHealth>;
    async fn thread_pools(&self) -> Result<Vec<ThreadPoolStat>>;
    async fn jvm(&self) -> Result<Vec<JvmStat>>;
    /// Largest indices first
    async fn largest_indices(&self, limit: usize) -> Result<Vec<IndexSize>>;
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
    #[serde(default)]
    number_of_nodes: u32,
    #[serde(default)]
    unassigned_shards: u32,
}

#[derive(Debug, Deserialize)]
struct NodesBody<T> {
    nodes: BTreeMap<String, T>,
}

#[derive(Debug, Deserialize)]
struct PoolNode {
    name: String,
    #[serde(default)]
    thread_pool: BTreeMap<String, PoolBody>,
}

#[derive(Debug, Deserialize)]
struct PoolBody {
    #[serde(default)]
    active: u64,
    #[serde(default)]
    queue: u64,
    #[serde(default)]
    rejected: u64,
}

#[derive(Debug, Deserialize)]
struct JvmNode {
    name: String,
    jvm: JvmBody,
}

#[derive(Debug, Deserialize)]
struct JvmBody {
    mem: JvmMem,
}

#[derive(Debug, Deserialize)]
struct JvmMem {
    heap_used_percent: f64,
}

#[derive(Debug, Deserialize)]
struct CatIndex {
    index: String,
    #[serde(rename = "store.size")]
    store_size: Option<String>,
}

pub fn parse_cluster_health(raw: &str) -> Result<ClusterHealth> {
    let body: HealthBody = decode("_cluster/health", raw)?;
    let status = SearchStatus::parse(&body.status).ok_or_else(|| {
        HiveError::invalid_response("_cluster/health", format!("status {:?}", body.status))
    })?;
    Ok(ClusterHealth {
        status,
        number_of_nodes: body.number_of_nodes,
        unassigned_shards: body.unassigned_shards,
    })
}

pub fn parse_thread_pools(raw: &str) -> Result<Vec<ThreadPoolStat>> {
    let body: NodesBody<PoolNode> = decode("_nodes/stats/thread_pool", raw)?;
    let mut stats = Vec::new();
    for node in body.nodes.into_values() {
        for (pool, s) in node.thread_pool {
            if WATCHED_POOLS.contains(&pool.as_str()) {
                stats.push(ThreadPoolStat {
                    node: node.name.clone(),
                    pool,
                    active: s.active,
                    queue: s.queue,
                    rejected: s.rejected,
                });
            }
        }
    }
    Ok(stats)
}

pub fn parse_jvm(raw: &str) -> Result<Vec<JvmStat>> {
    let body: NodesBody<JvmNode> = decode("_nodes/stats/jvm", raw)?;
    Ok(body
        .nodes
        .into_values()
        .map(|n| JvmStat {
            node: n.name,
            heap_used_percent: n.jvm.mem.heap_used_percent,
        })
        .collect())
}

pub fn parse_cat_indices(raw: &str, limit: usize) -> Result<Vec<IndexSize>> {
    let rows: Vec<CatIndex> = decode("_cat/indices", raw)?;
    let mut sizes: Vec<IndexSize> = rows
        .into_iter()
        .map(|r| IndexSize {
            name: r.index,
            store_bytes: r
                .store_size
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0),
        })
        .collect();
    // Server already sorts, closed indices report no size
    sizes.sort_by(|a, b| b.store_bytes.cmp(&a.store_bytes));
    sizes.truncate(limit);
    Ok(sizes)
}

fn decode<T: DeserializeOwned>(endpoint: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| HiveError::invalid_response(endpoint, e.to_string()))
}

/// Elasticsearch-compatible HTTP endpoint
pub struct ElasticsearchClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ElasticsearchClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HiveError::InvalidConfig(format!("search client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", self.endpoint, path);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        // _cluster/health answers 503 with a body while red
        if !status.is_success() && !(path.starts_with("_cluster/health") && !body.is_empty()) {
            return Err(HiveError::TransientUnavailable(format!(
                "{} returned {}",
                path, status
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl SearchEngine for ElasticsearchClient {
    async fn cluster_health(&self) -> Result<ClusterHealth> {
        parse_cluster_health(&self.get_text("_cluster/health").await?)
    }

    async fn thread_pools(&self) -> Result<Vec<ThreadPoolStat>> {
        parse_thread_pools(&self.get_text("_nodes/stats/thread_pool").await?)
    }

    async fn jvm(&self) -> Result<Vec<JvmStat>> {
        parse_jvm(&self.get_text("_nodes/stats/jvm").await?)
    }

    async fn largest_indices(&self, limit: usize) -> Result<Vec<IndexSize>> {
        let raw = self
            .get_text("_cat/indices?format=json&bytes=b&h=index,store.size&s=store.size:desc")
            .await?;
        parse_cat_indices(&raw, limit)
    }
}
