//! Fix history log
//!
//! Every transition of an [`AppliedImprovementRecord`] is appended as a full
//! snapshot. The latest line for an id is its current state; earlier lines
//! stay for audit and manual rollback replay.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{latest_per_id, FixHistory};
use crate::error::StoreResult;
use crate::types::AppliedImprovementRecord;

/// In-memory fix history
#[derive(Default)]
pub struct MemoryFixHistory {
    transitions: RwLock<Vec<AppliedImprovementRecord>>,
}

impl MemoryFixHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transition ever appended, oldest first
    pub async fn transitions(&self) -> Vec<AppliedImprovementRecord> {
        self.transitions.read().await.clone()
    }
}

#[async_trait]
impl FixHistory for MemoryFixHistory {
    async fn append(&self, record: &AppliedImprovementRecord) -> StoreResult<()> {
        self.transitions.write().await.push(record.clone());
        Ok(())
    }

    async fn records(&self) -> StoreResult<Vec<AppliedImprovementRecord>> {
        Ok(latest_per_id(self.transitions.read().await.clone()))
    }
}

/// JSON Lines fix history on disk
pub struct JsonlFixHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlFixHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl FixHistory for JsonlFixHistory {
    async fn append(&self, record: &AppliedImprovementRecord) -> StoreResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn records(&self) -> StoreResult<Vec<AppliedImprovementRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut transitions = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AppliedImprovementRecord>(line) {
                Ok(record) => transitions.push(record),
                Err(e) => debug!("Skipping malformed fix history line: {}", e),
            }
        }
        Ok(latest_per_id(transitions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImprovementCandidate, ImprovementKind, ImprovementStatus, RiskTier};
    use chrono::Utc;

    fn record(id: &str, status: ImprovementStatus) -> AppliedImprovementRecord {
        AppliedImprovementRecord {
            id: id.to_string(),
            agent_id: "coder-001".to_string(),
            candidate: ImprovementCandidate {
                id: "cand".to_string(),
                agent_id: "coder-001".to_string(),
                kind: ImprovementKind::RetryAdd,
                risk_tier: RiskTier::Low,
                rationale: "retries".to_string(),
                proposed_config_delta: serde_json::Map::new(),
            },
            config_snapshot_before: serde_json::Map::new(),
            applied_at: Utc::now(),
            status,
            baseline_stats: None,
            treatment_stats: None,
            resolution: None,
            resolved_at: None,
            failure: None,
        }
    }

    #[tokio::test]
    async fn test_latest_transition_wins() {
        let history = MemoryFixHistory::new();
        history.append(&record("fix-1", ImprovementStatus::PendingValidation)).await.unwrap();
        history.append(&record("fix-2", ImprovementStatus::ApplyFailed)).await.unwrap();
        history.append(&record("fix-1", ImprovementStatus::Committed)).await.unwrap();

        let records = history.records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "fix-1");
        assert_eq!(records[0].status, ImprovementStatus::Committed);
        assert_eq!(history.transitions().await.len(), 3);
    }

    #[tokio::test]
    async fn test_jsonl_history_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixes.jsonl");
        {
            let history = JsonlFixHistory::new(&path);
            history.append(&record("fix-1", ImprovementStatus::PendingValidation)).await.unwrap();
            history.append(&record("fix-1", ImprovementStatus::RolledBack)).await.unwrap();
        }

        let reopened = JsonlFixHistory::new(&path);
        let found = reopened.get("fix-1").await.unwrap().unwrap();
        assert_eq!(found.status, ImprovementStatus::RolledBack);
        assert!(reopened.get("missing").await.unwrap().is_none());
    }
}
