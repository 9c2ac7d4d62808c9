//! Configuration applier
//!
//! The single write path for agent configuration. Apply, rollback and
//! rollback replay all take the same per-agent lock, so a validation
//! decision can never race an apply for the same agent.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::error::{ImproveError, StoreResult};
use crate::store::{ConfigStore, FixHistory};
use crate::types::{AgentConfig, AppliedImprovementRecord, ImprovementCandidate, ImprovementStatus};

/// Merge `delta` over `base`. Nested objects merge key by key; any other
/// value in `delta` replaces the one in `base`.
pub fn merge_config(mut base: AgentConfig, delta: &AgentConfig) -> AgentConfig {
    for (key, value) in delta {
        if let (Some(Value::Object(existing)), Value::Object(patch)) = (base.get_mut(key), value) {
            let merged = merge_config(std::mem::take(existing), patch);
            *existing = merged;
            continue;
        }
        base.insert(key.clone(), value.clone());
    }
    base
}

pub struct Applier {
    configs: Arc<dyn ConfigStore>,
    history: Arc<dyn FixHistory>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl Applier {
    pub fn new(configs: Arc<dyn ConfigStore>, history: Arc<dyn FixHistory>) -> Self {
        Self {
            configs,
            history,
            locks: RwLock::new(HashMap::new()),
        }
    }

    async fn agent_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(agent_id) {
            return lock.clone();
        }
        self.locks
            .write()
            .await
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    /// Snapshot the agent's configuration and write the candidate's delta over it.
    ///
    /// Always returns a record. A store fault yields status `ApplyFailed` with
    /// the error text in `failure`; the caller refunds the cooldown.
    pub async fn apply(&self, candidate: &ImprovementCandidate, applied_at: DateTime<Utc>) -> AppliedImprovementRecord {
        let agent_id = candidate.agent_id.as_str();
        let lock = self.agent_lock(agent_id).await;
        let _guard = lock.lock().await;

        let mut record = AppliedImprovementRecord {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            candidate: candidate.clone(),
            config_snapshot_before: AgentConfig::new(),
            applied_at,
            status: ImprovementStatus::PendingValidation,
            baseline_stats: None,
            treatment_stats: None,
            resolution: None,
            resolved_at: None,
            failure: None,
        };

        let written = async {
            let before = self.configs.get(agent_id).await?;
            record.config_snapshot_before = before.clone();
            let after = merge_config(before, &candidate.proposed_config_delta);
            self.configs.set(agent_id, after).await
        }
        .await;

        if let Err(source) = written {
            let err = ImproveError::ApplyFailed {
                agent_id: agent_id.to_string(),
                source,
            };
            warn!(agent_id, kind = %candidate.kind, "{}", err);
            record.status = ImprovementStatus::ApplyFailed;
            record.failure = Some(err.to_string());
        } else {
            info!(agent_id, record_id = %record.id, kind = %candidate.kind, "Applied improvement");
        }

        if let Err(e) = self.history.append(&record).await {
            warn!(agent_id, record_id = %record.id, "Failed to append fix history: {}", e);
        }
        record
    }

    /// Restore `config_snapshot_before` through the apply path
    pub async fn rollback(&self, record: &AppliedImprovementRecord) -> Result<(), ImproveError> {
        let lock = self.agent_lock(&record.agent_id).await;
        let _guard = lock.lock().await;

        self.configs
            .set(&record.agent_id, record.config_snapshot_before.clone())
            .await
            .map_err(|source| ImproveError::RollbackFailed {
                record_id: record.id.clone(),
                agent_id: record.agent_id.clone(),
                source,
            })?;
        info!(agent_id = %record.agent_id, record_id = %record.id, "Restored configuration snapshot");
        Ok(())
    }

    /// Append a transition of `record` to the fix history
    pub async fn persist(&self, record: &AppliedImprovementRecord) -> StoreResult<()> {
        self.history.append(record).await
    }

    /// Re-apply the snapshot of a resolved record, for operators.
    ///
    /// Works for committed and rolled-back records. A committed record
    /// becomes rolled-back; a failed earlier rollback is cleared.
    pub async fn replay_rollback(&self, record_id: &str) -> Result<AppliedImprovementRecord, ImproveError> {
        let mut record = self
            .history
            .get(record_id)
            .await?
            .ok_or_else(|| ImproveError::UnknownRecord(record_id.to_string()))?;

        if !matches!(record.status, ImprovementStatus::Committed | ImprovementStatus::RolledBack) {
            return Err(ImproveError::NotReplayable {
                id: record.id,
                status: record.status.to_string(),
            });
        }

        if let Err(e) = self.rollback(&record).await {
            error!(agent_id = %record.agent_id, record_id, "Rollback replay failed: {}", e);
            return Err(e);
        }

        record.status = ImprovementStatus::RolledBack;
        record.failure = None;
        record.resolved_at = Some(Utc::now());
        self.persist(&record).await?;
        Ok(record)
    }

    /// Every record in the fix history, optionally for one agent
    pub async fn history(&self, agent_id: Option<&str>) -> StoreResult<Vec<AppliedImprovementRecord>> {
        let records = self.history.records().await?;
        Ok(records
            .into_iter()
            .filter(|r| agent_id.map_or(true, |a| r.agent_id == a))
            .collect())
    }

    pub fn configs(&self) -> Arc<dyn ConfigStore> {
        self.configs.clone()
    }
}
