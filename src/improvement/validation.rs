//! A/B validation of applied improvements
//!
//! The baseline is the `baseline_window` most recent executions at or before
//! `applied_at`. The treatment is the first `treatment_window` executions
//! after it, gathered by an asynchronous watcher on the recorder's broadcast
//! stream. The watcher resolves on a full treatment window, on its deadline,
//! or on cancellation; anything but a passing comparison rolls back.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ImproverConfig;
use crate::error::StoreResult;
use crate::store::{Notifier, TraceLog};
use crate::types::{
    AppliedImprovementRecord, ExecutionRecord, ImprovementStatus, ResolutionReason, WindowStats,
};

use super::applier::Applier;

/// Window sizes and thresholds for the commit rule
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub baseline_window: usize,
    pub treatment_window: usize,
    /// Treatment mean duration may be at most this multiple of the baseline's
    pub duration_tolerance: f64,
    pub timeout: Duration,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::from_config(&ImproverConfig::default())
    }
}

impl ValidationPolicy {
    pub fn from_config(config: &ImproverConfig) -> Self {
        Self {
            baseline_window: config.baseline_window,
            treatment_window: config.treatment_window,
            duration_tolerance: config.duration_tolerance,
            timeout: config.treatment_timeout(),
        }
    }
}

/// Commit rule: treatment success rate at least the baseline's, and mean
/// duration within tolerance of the baseline's. An empty baseline has no
/// duration to compare against.
pub fn decide(baseline: &WindowStats, treatment: &WindowStats, tolerance: f64) -> ResolutionReason {
    if treatment.success_rate < baseline.success_rate {
        return ResolutionReason::Regression;
    }
    if baseline.samples > 0 && treatment.mean_duration_ms > baseline.mean_duration_ms * tolerance {
        return ResolutionReason::Regression;
    }
    ResolutionReason::Passed
}

pub struct ValidationController {
    log: Arc<dyn TraceLog>,
    events: broadcast::Sender<ExecutionRecord>,
    applier: Arc<Applier>,
    notifier: Arc<dyn Notifier>,
    policy: ValidationPolicy,
}

impl ValidationController {
    /// `events` is the recorder's broadcast sender; each watcher subscribes
    /// its own receiver.
    pub fn new(
        log: Arc<dyn TraceLog>,
        events: broadcast::Sender<ExecutionRecord>,
        applier: Arc<Applier>,
        notifier: Arc<dyn Notifier>,
        policy: ValidationPolicy,
    ) -> Self {
        Self {
            log,
            events,
            applier,
            notifier,
            policy,
        }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// The most recent executions at or before `applied_at`, oldest first
    pub async fn collect_baseline(
        &self,
        agent_id: &str,
        applied_at: DateTime<Utc>,
    ) -> StoreResult<Vec<ExecutionRecord>> {
        let mut records = self
            .log
            .scan(Some(agent_id), DateTime::<Utc>::MIN_UTC, applied_at)
            .await?;
        let skip = records.len().saturating_sub(self.policy.baseline_window);
        Ok(records.split_off(skip))
    }

    /// Executions after `applied_at` already in the log
    async fn scan_treatment(&self, agent_id: &str, applied_at: DateTime<Utc>) -> Vec<ExecutionRecord> {
        match self
            .log
            .scan(Some(agent_id), applied_at, DateTime::<Utc>::MAX_UTC)
            .await
        {
            Ok(records) => records.into_iter().filter(|r| r.timestamp > applied_at).collect(),
            Err(e) => {
                warn!(agent_id, "Treatment rescan failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Watch for the treatment window, then commit or roll back.
    ///
    /// A fired `cancel` resolves as a cancelled rollback. A dropped sender is
    /// ignored. Returns the resolved record after persisting it.
    pub async fn validate(
        &self,
        mut record: AppliedImprovementRecord,
        mut cancel: oneshot::Receiver<()>,
    ) -> AppliedImprovementRecord {
        let agent_id = record.agent_id.clone();
        let applied_at = record.applied_at;
        let wanted = self.policy.treatment_window;

        // Subscribe before the rescan so nothing falls between the two
        let mut events = self.events.subscribe();
        let mut seen: HashSet<String> = HashSet::new();
        let mut treatment: Vec<ExecutionRecord> = Vec::new();
        for r in self.scan_treatment(&agent_id, applied_at).await {
            if seen.insert(r.id.clone()) {
                treatment.push(r);
            }
        }

        let deadline = tokio::time::sleep(self.policy.timeout);
        tokio::pin!(deadline);
        let mut cancel_live = true;

        let early_exit = loop {
            if treatment.len() >= wanted {
                break None;
            }
            tokio::select! {
                _ = &mut deadline => break Some(ResolutionReason::Timeout),
                sent = &mut cancel, if cancel_live => match sent {
                    Ok(()) => break Some(ResolutionReason::Cancelled),
                    Err(_) => cancel_live = false,
                },
                received = events.recv() => match received {
                    Ok(r) => {
                        if r.agent_id == agent_id && r.timestamp > applied_at && seen.insert(r.id.clone()) {
                            treatment.push(r);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(agent_id = %agent_id, missed, "Treatment watcher lagged, rescanning log");
                        for r in self.scan_treatment(&agent_id, applied_at).await {
                            if seen.insert(r.id.clone()) {
                                treatment.push(r);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break Some(ResolutionReason::Timeout),
                },
            }
        };

        treatment.sort_by_key(|r| r.timestamp);
        treatment.truncate(wanted);
        let treatment_stats = WindowStats::from_records(&treatment);
        let baseline_stats = record.baseline_stats.clone().unwrap_or_default();

        let reason = early_exit.unwrap_or_else(|| {
            decide(&baseline_stats, &treatment_stats, self.policy.duration_tolerance)
        });
        record.treatment_stats = Some(treatment_stats);
        record.resolution = Some(reason);
        record.resolved_at = Some(Utc::now());

        match reason {
            ResolutionReason::Passed => {
                record.status = ImprovementStatus::Committed;
                info!(agent_id = %agent_id, record_id = %record.id, kind = %record.candidate.kind, "Improvement committed");
            }
            _ => {
                match reason {
                    ResolutionReason::Timeout => warn!(
                        agent_id = %agent_id,
                        record_id = %record.id,
                        reason = "timeout",
                        samples = treatment.len(),
                        "Treatment window did not fill, rolling back"
                    ),
                    _ => info!(
                        agent_id = %agent_id,
                        record_id = %record.id,
                        reason = %reason,
                        "Rolling back improvement"
                    ),
                }
                record.status = ImprovementStatus::RolledBack;
                if let Err(e) = self.applier.rollback(&record).await {
                    error!(agent_id = %agent_id, record_id = %record.id, "{}", e);
                    let message = format!(
                        "Rollback of improvement {} failed; configuration state unknown: {}",
                        record.id, e
                    );
                    if let Err(notify_err) = self.notifier.notify(&agent_id, &message).await {
                        debug!("Notifier failed: {}", notify_err);
                    }
                    record.failure = Some(e.to_string());
                }
            }
        }

        if let Err(e) = self.applier.persist(&record).await {
            warn!(agent_id = %agent_id, record_id = %record.id, "Failed to append fix history: {}", e);
        }
        record
    }
}
