//! Search-engine health samples and severity classification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Green,
    Yellow,
    Red,
    Unreachable,
}

impl SearchStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "green" => Some(Self::Green),
            "yellow" => Some(Self::Yellow),
            "red" => Some(Self::Red),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: SearchStatus,
    pub number_of_nodes: u32,
    pub unassigned_shards: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPoolStat {
    pub node: String,
    pub pool: String,
    pub active: u64,
    pub queue: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JvmStat {
    pub node: String,
    pub heap_used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSize {
    pub name: String,
    pub store_bytes: u64,
}

/// Timestamped snapshot of the search engine. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub taken_at: DateTime<Utc>,
    pub status: SearchStatus,
    pub latency_ms: u64,
    /// Queued tasks per pool, summed over nodes
    pub queue_depths: BTreeMap<String, u64>,
    /// Rejected tasks per pool, summed over nodes
    pub rejections: BTreeMap<String, u64>,
    /// Highest heap usage among nodes
    pub heap_used_percent: Option<f64>,
    pub largest_indices: Vec<IndexSize>,
}

impl HealthSample {
    pub fn unreachable(latency_ms: u64) -> Self {
        Self {
            taken_at: Utc::now(),
            status: SearchStatus::Unreachable,
            latency_ms,
            queue_depths: BTreeMap::new(),
            rejections: BTreeMap::new(),
            heap_used_percent: None,
            largest_indices: Vec::new(),
        }
    }

    pub fn from_stats(
        health: &ClusterHealth,
        latency_ms: u64,
        pools: &[ThreadPoolStat],
        jvm: &[JvmStat],
        largest_indices: Vec<IndexSize>,
    ) -> Self {
        let mut queue_depths = BTreeMap::new();
        let mut rejections = BTreeMap::new();
        for stat in pools {
            *queue_depths.entry(stat.pool.clone()).or_insert(0) += stat.queue;
            *rejections.entry(stat.pool.clone()).or_insert(0) += stat.rejected;
        }

        let heap_used_percent = jvm
            .iter()
            .map(|j| j.heap_used_percent)
            .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))));

        Self {
            taken_at: Utc::now(),
            status: health.status,
            latency_ms,
            queue_depths,
            rejections,
            heap_used_percent,
            largest_indices,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Healthy,
    Warning,
    Critical,
}

/// One classified observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub check: String,
    pub message: String,
}

impl Finding {
    fn new(severity: Severity, check: &str, message: String) -> Self {
        Self {
            severity,
            check: check.to_string(),
            message,
        }
    }
}

/// Fixed classification thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub heap_critical_percent: f64,
    pub latency_warning_ms: u64,
    pub queue_warning: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            heap_critical_percent: 85.0,
            latency_warning_ms: 2_000,
            queue_warning: 100,
        }
    }
}

/// Classify a sample. An empty result means healthy.
pub fn classify(sample: &HealthSample, thresholds: &Thresholds) -> Vec<Finding> {
    let mut findings = Vec::new();

    match sample.status {
        SearchStatus::Unreachable => {
            findings.push(Finding::new(
                Severity::Critical,
                "cluster-status",
                "search engine unreachable".to_string(),
            ));
            // Nothing else in the sample is meaningful
            return findings;
        }
        SearchStatus::Red => findings.push(Finding::new(
            Severity::Critical,
            "cluster-status",
            "cluster status red: primary shards unassigned".to_string(),
        )),
        SearchStatus::Yellow => findings.push(Finding::new(
            Severity::Warning,
            "cluster-status",
            "cluster status yellow: replica shards unassigned".to_string(),
        )),
        SearchStatus::Green => {}
    }

    if let Some(heap) = sample.heap_used_percent {
        if heap > thresholds.heap_critical_percent {
            findings.push(Finding::new(
                Severity::Critical,
                "jvm-heap",
                format!(
                    "heap used {:.1}% exceeds {:.0}%",
                    heap, thresholds.heap_critical_percent
                ),
            ));
        }
    }

    for (pool, rejected) in &sample.rejections {
        if *rejected > 0 {
            findings.push(Finding::new(
                Severity::Critical,
                "thread-pool-rejections",
                format!("{} pool rejected {} tasks", pool, rejected),
            ));
        }
    }

    for (pool, queued) in &sample.queue_depths {
        if *queued > thresholds.queue_warning {
            findings.push(Finding::new(
                Severity::Warning,
                "thread-pool-queue",
                format!("{} pool has {} queued tasks", pool, queued),
            ));
        }
    }

    if sample.latency_ms > thresholds.latency_warning_ms {
        findings.push(Finding::new(
            Severity::Warning,
            "latency",
            format!(
                "health endpoint took {}ms (ceiling {}ms)",
                sample.latency_ms, thresholds.latency_warning_ms
            ),
        ));
    }

    findings
}

/// Worst severity among findings
pub fn overall_severity(findings: &[Finding]) -> Severity {
    findings
        .iter()
        .map(|f| f.severity)
        .max()
        .unwrap_or(Severity::Healthy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn green_sample(heap: f64) -> HealthSample {
        let health = ClusterHealth {
            status: SearchStatus::Green,
            number_of_nodes: 3,
            unassigned_shards: 0,
        };
        let pools = vec![ThreadPoolStat {
            node: "n1".to_string(),
            pool: "search".to_string(),
            active: 1,
            queue: 0,
            rejected: 0,
        }];
        let jvm = vec![
            JvmStat {
                node: "n1".to_string(),
                heap_used_percent: 40.0,
            },
            JvmStat {
                node: "n2".to_string(),
                heap_used_percent: heap,
            },
        ];
        HealthSample::from_stats(&health, 15, &pools, &jvm, Vec::new())
    }

    #[test]
    fn test_heap_92_is_single_critical() {
        let findings = classify(&green_sample(92.0), &Thresholds::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].check, "jvm-heap");
    }

    #[test]
    fn test_heap_80_is_healthy() {
        let findings = classify(&green_sample(80.0), &Thresholds::default());
        assert!(findings.is_empty());
        assert_eq!(overall_severity(&findings), Severity::Healthy);
    }

    #[test]
    fn test_any_rejection_is_critical() {
        let mut sample = green_sample(10.0);
        sample.rejections.insert("write".to_string(), 1);
        let findings = classify(&sample, &Thresholds::default());
        assert_eq!(overall_severity(&findings), Severity::Critical);
    }

    #[test]
    fn test_slow_response_is_warning() {
        let mut sample = green_sample(10.0);
        sample.latency_ms = 5_000;
        let findings = classify(&sample, &Thresholds::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
    }

    #[test]
    fn test_unreachable_short_circuits() {
        let findings = classify(&HealthSample::unreachable(0), &Thresholds::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].check, "cluster-status");
    }

    #[test]
    fn test_sample_aggregates_pools_across_nodes() {
        let health = ClusterHealth {
            status: SearchStatus::Yellow,
            number_of_nodes: 2,
            unassigned_shards: 1,
        };
        let stat = |node: &str, queue| ThreadPoolStat {
            node: node.to_string(),
            pool: "write".to_string(),
            active: 0,
            queue,
            rejected: 0,
        };
        let sample = HealthSample::from_stats(&health, 1, &[stat("a", 60), stat("b", 70)], &[], vec![]);
        assert_eq!(sample.queue_depths["write"], 130);
        assert_eq!(sample.heap_used_percent, None);

        let findings = classify(&sample, &Thresholds::default());
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.severity == Severity::Warning));
    }
}
