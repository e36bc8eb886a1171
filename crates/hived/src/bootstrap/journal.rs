//! Bootstrap journal persistence
//!
//! Local JSON file (`<state_dir>/bootstrap.json`) recording how far the last
//! bootstrap attempt got. A journal in READY stops a restarted daemon from
//! deploying again; FAILED waits for `hived --rebootstrap`.

use super::machine::BootstrapState;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hive_common::cluster::{ClusterEpoch, NodeRole};
use hive_common::error::HiveError;
use hive_common::CapacityPlan;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub state: BootstrapState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Step that failed
    pub state: BootstrapState,
    pub kind: String,
    pub message: String,
    pub operator_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapJournal {
    pub attempt_id: Uuid,
    pub hostname: Option<String>,
    pub role: Option<NodeRole>,
    pub history: Vec<JournalEntry>,
    pub epoch: Option<ClusterEpoch>,
    pub plan: Option<CapacityPlan>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureRecord>,
}

impl Default for BootstrapJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapJournal {
    pub fn new() -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            hostname: None,
            role: None,
            history: vec![JournalEntry {
                state: BootstrapState::DetectRole,
                at: Utc::now(),
            }],
            epoch: None,
            plan: None,
            deployed_at: None,
            failure: None,
        }
    }

    pub fn current(&self) -> BootstrapState {
        self.history
            .last()
            .map(|e| e.state)
            .unwrap_or(BootstrapState::DetectRole)
    }

    pub fn record(&mut self, state: BootstrapState) {
        self.history.push(JournalEntry {
            state,
            at: Utc::now(),
        });
    }

    pub fn record_failure(&mut self, step: BootstrapState, err: &HiveError) {
        self.failure = Some(FailureRecord {
            state: step,
            kind: err.kind().to_string(),
            message: err.to_string(),
            operator_visible: err.is_operator_visible(),
        });
    }

    /// `None` when no journal exists yet
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no bootstrap journal");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let journal: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse bootstrap journal {}", path.display()))?;
        Ok(Some(journal))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("Failed to create state directory")?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize journal")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .context("Failed to write journal")?;
        tokio::fs::rename(&tmp, path)
            .await
            .context("Failed to replace journal")?;
        debug!(state = %self.current(), "journal saved");
        Ok(())
    }

    /// Forget the previous attempt
    pub async fn clear(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "bootstrap journal cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}
