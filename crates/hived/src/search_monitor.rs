//! Search-engine health monitor
//!
//! Read-only. Each cycle takes one sample, classifies it, emits one log
//! event per finding and appends the sample to a JSON-lines file.

use crate::scheduler::Cycle;
use anyhow::Context;
use async_trait::async_trait;
use hive_common::config::SearchConfig;
use hive_common::error::{HiveError, Result};
use hive_common::search::{classify, overall_severity, Finding, HealthSample, Severity};
use hive_common::search_client::SearchEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

pub struct SearchMonitor {
    engine: Arc<dyn SearchEngine>,
    config: SearchConfig,
    sample_log: PathBuf,
}

impl SearchMonitor {
    pub fn new(engine: Arc<dyn SearchEngine>, config: SearchConfig, sample_log: PathBuf) -> Self {
        Self {
            engine,
            config,
            sample_log,
        }
    }

    /// One sample; an unreachable engine is a sample, not an error
    pub async fn probe(&self) -> HealthSample {
        let started = Instant::now();
        let health = self.engine.cluster_health().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let health = match health {
            Ok(h) => h,
            Err(e) => {
                debug!(error = %e, "cluster health probe failed");
                return HealthSample::unreachable(latency_ms);
            }
        };

        let pools = self.engine.thread_pools().await.unwrap_or_else(|e| {
            debug!(error = %e, "thread pool stats unavailable");
            Vec::new()
        });
        let jvm = self.engine.jvm().await.unwrap_or_else(|e| {
            debug!(error = %e, "jvm stats unavailable");
            Vec::new()
        });
        let indices = self
            .engine
            .largest_indices(self.config.top_indices)
            .await
            .unwrap_or_else(|e| {
                debug!(error = %e, "index sizes unavailable");
                Vec::new()
            });

        HealthSample::from_stats(&health, latency_ms, &pools, &jvm, indices)
    }

    fn emit(sample: &HealthSample, findings: &[Finding]) {
        if findings.is_empty() {
            info!(
                status = ?sample.status,
                latency_ms = sample.latency_ms,
                heap_used_percent = sample.heap_used_percent,
                "search engine healthy"
            );
            return;
        }
        for finding in findings {
            match finding.severity {
                Severity::Critical => error!(
                    check = %finding.check,
                    severity = "critical",
                    status = ?sample.status,
                    "{}",
                    finding.message
                ),
                Severity::Warning => warn!(
                    check = %finding.check,
                    severity = "warning",
                    status = ?sample.status,
                    "{}",
                    finding.message
                ),
                Severity::Healthy => info!(check = %finding.check, "{}", finding.message),
            }
        }
    }

    async fn append_sample(&self, sample: &HealthSample) -> anyhow::Result<()> {
        if let Some(dir) = self.sample_log.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("Failed to create state directory")?;
        }
        let mut line = serde_json::to_string(sample).context("Failed to serialize sample")?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sample_log)
            .await
            .with_context(|| format!("Failed to open {}", self.sample_log.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append sample")?;
        Ok(())
    }

    pub async fn cycle(&self) -> (HealthSample, Vec<Finding>) {
        let sample = self.probe().await;
        let findings = classify(&sample, &self.config.thresholds());
        Self::emit(&sample, &findings);
        if let Err(e) = self.append_sample(&sample).await {
            warn!(error = %e, "sample log not written");
        }
        debug!(severity = ?overall_severity(&findings), "search health cycle done");
        (sample, findings)
    }
}

#[async_trait]
impl Cycle for SearchMonitor {
    fn name(&self) -> &'static str {
        "search-health"
    }

    async fn run_cycle(&self) -> std::result::Result<(), HiveError> {
        self.cycle().await;
        Ok(())
    }
}

/// Read back the last `limit` samples
pub async fn recent_samples(path: &std::path::Path, limit: usize) -> Result<Vec<HealthSample>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut samples: Vec<HealthSample> = contents
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let skip = samples.len().saturating_sub(limit);
    Ok(samples.split_off(skip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_common::fakes::FakeSearchEngine;
    use hive_common::search::SearchStatus;

    fn monitor(engine: Arc<FakeSearchEngine>, dir: &std::path::Path) -> SearchMonitor {
        SearchMonitor::new(engine, SearchConfig::default(), dir.join("search-health.jsonl"))
    }

    #[tokio::test]
    async fn test_high_heap_is_one_critical() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(Arc::new(FakeSearchEngine::green(92.0)), dir.path());
        let (sample, findings) = m.cycle().await;
        assert_eq!(sample.heap_used_percent, Some(92.0));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].check, "jvm-heap");
    }

    #[tokio::test]
    async fn test_normal_heap_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(Arc::new(FakeSearchEngine::green(80.0)), dir.path());
        let (_, findings) = m.cycle().await;
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_sample_logged() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeSearchEngine::green(30.0));
        engine.update(|s| s.reachable = false);
        let m = monitor(engine, dir.path());

        let (sample, findings) = m.cycle().await;
        assert_eq!(sample.status, SearchStatus::Unreachable);
        assert_eq!(overall_severity(&findings), Severity::Critical);

        m.cycle().await;
        let samples = recent_samples(&dir.path().join("search-health.jsonl"), 10)
            .await
            .unwrap();
        assert_eq!(samples.len(), 2);
    }

    #[tokio::test]
    async fn test_rejections_are_critical() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeSearchEngine::green(30.0));
        engine.update(|s| s.pools[0].rejected = 4);
        let (_, findings) = monitor(engine, dir.path()).cycle().await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].check, "thread-pool-rejections");
    }
}
