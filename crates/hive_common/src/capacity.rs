//! Search-engine capacity planning
//!
//! `plan` maps a cluster size onto replica counts, heap tiering, thread pools
//! and circuit breakers. The result is an immutable snapshot: callers replan
//! whenever the node count changes and hand the new plan to the deployer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;

/// Upper bound on search-engine replicas
pub const MAX_SEARCH_REPLICAS: usize = 3;

/// Per-tier heap sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapTiers {
    pub single: String,
    pub pair: String,
    pub large: String,
}

impl Default for HeapTiers {
    fn default() -> Self {
        Self {
            single: "512m".to_string(),
            pair: "1g".to_string(),
            large: "2g".to_string(),
        }
    }
}

/// Linear growth and hard cap for one thread pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolScaling {
    pub per_node: u32,
    pub cap: u32,
    pub queue_multiplier: u32,
}

impl PoolScaling {
    fn size_for(&self, node_count: usize) -> u32 {
        let grown = (node_count as u64).saturating_mul(self.per_node as u64);
        grown.min(self.cap as u64) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTables {
    pub search: PoolScaling,
    pub write: PoolScaling,
    pub get: PoolScaling,
}

impl Default for PoolTables {
    fn default() -> Self {
        Self {
            search: PoolScaling {
                per_node: 4,
                cap: 12,
                queue_multiplier: 1000,
            },
            write: PoolScaling {
                per_node: 2,
                cap: 8,
                queue_multiplier: 500,
            },
            get: PoolScaling {
                per_node: 2,
                cap: 6,
                queue_multiplier: 1000,
            },
        }
    }
}

/// Circuit-breaker limits, percent of heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerLimits {
    pub total: u8,
    pub request: u8,
    pub field_data: u8,
    pub network: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerTiers {
    /// One node: nothing to spread load onto
    pub single: BreakerLimits,
    /// Two or three nodes
    pub small: BreakerLimits,
    /// More than three nodes
    pub large: BreakerLimits,
}

impl Default for BreakerTiers {
    fn default() -> Self {
        Self {
            single: BreakerLimits {
                total: 60,
                request: 40,
                field_data: 30,
                network: 40,
            },
            small: BreakerLimits {
                total: 70,
                request: 50,
                field_data: 40,
                network: 50,
            },
            large: BreakerLimits {
                total: 85,
                request: 60,
                field_data: 50,
                network: 60,
            },
        }
    }
}

/// Tables the planner reads; overridable from the `[planner]` config section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerTables {
    #[serde(default = "default_master_prefix")]
    pub master_prefix: String,
    #[serde(default)]
    pub heap: HeapTiers,
    #[serde(default)]
    pub pools: PoolTables,
    #[serde(default)]
    pub breakers: BreakerTiers,
}

fn default_master_prefix() -> String {
    "search".to_string()
}

impl Default for PlannerTables {
    fn default() -> Self {
        Self {
            master_prefix: default_master_prefix(),
            heap: HeapTiers::default(),
            pools: PoolTables::default(),
            breakers: BreakerTiers::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizes {
    pub search: u32,
    pub write: u32,
    pub get: u32,
}

/// Sizing snapshot for the search-engine workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPlan {
    pub node_count: usize,
    pub search_replicas: usize,
    pub search_index_replicas: usize,
    pub initial_master_list: Vec<String>,
    pub heap_size: String,
    pub thread_pool_sizes: PoolSizes,
    pub thread_pool_queues: PoolSizes,
    pub circuit_breaker_limits: BreakerLimits,
}

impl PlannerTables {
    pub fn plan(&self, node_count: NonZeroUsize) -> CapacityPlan {
        let nodes = node_count.get();
        let search_replicas = nodes.min(MAX_SEARCH_REPLICAS);

        let initial_master_list = (1..=search_replicas)
            .map(|i| format!("{}-{}", self.master_prefix, i))
            .collect();

        let heap_size = match nodes {
            1 => self.heap.single.clone(),
            2 => self.heap.pair.clone(),
            _ => self.heap.large.clone(),
        };

        let pools = &self.pools;
        let thread_pool_sizes = PoolSizes {
            search: pools.search.size_for(nodes),
            write: pools.write.size_for(nodes),
            get: pools.get.size_for(nodes),
        };
        let thread_pool_queues = PoolSizes {
            search: thread_pool_sizes.search * pools.search.queue_multiplier,
            write: thread_pool_sizes.write * pools.write.queue_multiplier,
            get: thread_pool_sizes.get * pools.get.queue_multiplier,
        };

        let circuit_breaker_limits = match nodes {
            1 => self.breakers.single,
            2..=3 => self.breakers.small,
            _ => self.breakers.large,
        };

        CapacityPlan {
            node_count: nodes,
            search_replicas,
            // search_replicas >= 1 because node_count is non-zero
            search_index_replicas: search_replicas - 1,
            initial_master_list,
            heap_size,
            thread_pool_sizes,
            thread_pool_queues,
            circuit_breaker_limits,
        }
    }
}

/// Plan with the default tables
pub fn plan(node_count: NonZeroUsize) -> CapacityPlan {
    PlannerTables::default().plan(node_count)
}

impl CapacityPlan {
    /// Environment the stack definition interpolates at deploy time
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            env.insert(k.to_string(), v);
        };

        put("SEARCH_REPLICAS", self.search_replicas.to_string());
        put("SEARCH_INDEX_REPLICAS", self.search_index_replicas.to_string());
        put("SEARCH_INITIAL_MASTERS", self.initial_master_list.join(","));
        put("SEARCH_HEAP_SIZE", self.heap_size.clone());
        put(
            "SEARCH_JAVA_OPTS",
            format!("-Xms{} -Xmx{}", self.heap_size, self.heap_size),
        );
        put(
            "SEARCH_THREAD_POOL_SEARCH_SIZE",
            self.thread_pool_sizes.search.to_string(),
        );
        put(
            "SEARCH_THREAD_POOL_SEARCH_QUEUE",
            self.thread_pool_queues.search.to_string(),
        );
        put(
            "SEARCH_THREAD_POOL_WRITE_SIZE",
            self.thread_pool_sizes.write.to_string(),
        );
        put(
            "SEARCH_THREAD_POOL_WRITE_QUEUE",
            self.thread_pool_queues.write.to_string(),
        );
        put(
            "SEARCH_THREAD_POOL_GET_SIZE",
            self.thread_pool_sizes.get.to_string(),
        );
        put(
            "SEARCH_THREAD_POOL_GET_QUEUE",
            self.thread_pool_queues.get.to_string(),
        );

        let b = &self.circuit_breaker_limits;
        put("SEARCH_BREAKER_TOTAL", format!("{}%", b.total));
        put("SEARCH_BREAKER_REQUEST", format!("{}%", b.request));
        put("SEARCH_BREAKER_FIELDDATA", format!("{}%", b.field_data));
        put("SEARCH_BREAKER_NETWORK", format!("{}%", b.network));

        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(count: usize) -> NonZeroUsize {
        NonZeroUsize::new(count).unwrap()
    }

    #[test]
    fn test_replicas_for_one_to_ten_nodes() {
        for count in 1..=10 {
            let p = plan(n(count));
            assert_eq!(p.search_replicas, count.min(3), "nodes={}", count);
            assert_eq!(p.search_index_replicas, p.search_replicas - 1);
            assert_eq!(p.initial_master_list.len(), p.search_replicas);
        }
    }

    #[test]
    fn test_master_list_is_numbered_from_one() {
        let p = plan(n(5));
        assert_eq!(p.initial_master_list, vec!["search-1", "search-2", "search-3"]);
    }

    #[test]
    fn test_heap_tiers() {
        assert_eq!(plan(n(1)).heap_size, "512m");
        assert_eq!(plan(n(2)).heap_size, "1g");
        assert_eq!(plan(n(3)).heap_size, "2g");
        assert_eq!(plan(n(9)).heap_size, "2g");
    }

    #[test]
    fn test_thread_pools_grow_then_cap() {
        let one = plan(n(1));
        assert_eq!(one.thread_pool_sizes, PoolSizes { search: 4, write: 2, get: 2 });

        let big = plan(n(10));
        assert_eq!(big.thread_pool_sizes, PoolSizes { search: 12, write: 8, get: 6 });
        assert_eq!(
            big.thread_pool_queues,
            PoolSizes { search: 12_000, write: 4_000, get: 6_000 }
        );
    }

    #[test]
    fn test_breaker_tiers() {
        let tiers = BreakerTiers::default();
        assert_eq!(plan(n(1)).circuit_breaker_limits, tiers.single);
        assert_eq!(plan(n(2)).circuit_breaker_limits, tiers.small);
        assert_eq!(plan(n(3)).circuit_breaker_limits, tiers.small);
        assert_eq!(plan(n(4)).circuit_breaker_limits, tiers.large);
        assert!(tiers.large.total > tiers.small.total);
        assert!(tiers.small.total > tiers.single.total);
    }

    #[test]
    fn test_plan_is_deterministic() {
        assert_eq!(plan(n(4)), plan(n(4)));
    }

    #[test]
    fn test_env_rendering() {
        let env = plan(n(2)).to_env();
        assert_eq!(env["SEARCH_REPLICAS"], "2");
        assert_eq!(env["SEARCH_INDEX_REPLICAS"], "1");
        assert_eq!(env["SEARCH_INITIAL_MASTERS"], "search-1,search-2");
        assert_eq!(env["SEARCH_JAVA_OPTS"], "-Xms1g -Xmx1g");
        assert_eq!(env["SEARCH_BREAKER_TOTAL"], "70%");
    }

    #[test]
    fn test_custom_prefix() {
        let tables = PlannerTables {
            master_prefix: "es".to_string(),
            ..PlannerTables::default()
        };
        assert_eq!(tables.plan(n(2)).initial_master_list, vec!["es-1", "es-2"]);
    }
}
