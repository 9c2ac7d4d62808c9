//! Improvement pipeline
//!
//! Runs one trigger through generate -> gate -> apply, then hands the applied
//! record to a validation watcher. Each stage returns a value to the next;
//! none holds a reference back to its caller.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::metrics::analysis::FailureSignature;
use crate::store::Notifier;
use crate::types::{AppliedImprovementRecord, ImprovementCandidate, ImprovementStatus, WindowStats};

use super::applier::Applier;
use super::gate::{CooldownGate, RejectReason};
use super::generator::{generate, GeneratorPolicy};
use super::validation::ValidationController;

/// What a single pipeline run did
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub candidates: usize,
    pub manual_review: Vec<ImprovementCandidate>,
    pub rejected: Vec<(ImprovementCandidate, RejectReason)>,
    /// Pending validation or apply-failed
    pub applied: Option<AppliedImprovementRecord>,
}

/// A validation watcher. Kept after resolving until awaited or replaced.
struct Watcher {
    record_id: String,
    cancel: Option<oneshot::Sender<()>>,
    /// Set once the record resolves; closed without a value if aborted
    resolved: watch::Receiver<Option<AppliedImprovementRecord>>,
    handle: JoinHandle<()>,
}

pub struct ImprovementPipeline {
    gate: Arc<CooldownGate>,
    applier: Arc<Applier>,
    validator: Arc<ValidationController>,
    notifier: Arc<dyn Notifier>,
    policy: GeneratorPolicy,
    watchers: Mutex<HashMap<String, Watcher>>,
}

impl ImprovementPipeline {
    pub fn new(
        gate: Arc<CooldownGate>,
        applier: Arc<Applier>,
        validator: Arc<ValidationController>,
        notifier: Arc<dyn Notifier>,
        policy: GeneratorPolicy,
    ) -> Self {
        Self {
            gate,
            applier,
            validator,
            notifier,
            policy,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn gate(&self) -> &Arc<CooldownGate> {
        &self.gate
    }

    pub fn applier(&self) -> &Arc<Applier> {
        &self.applier
    }

    /// Run one trigger to the point where validation starts
    pub async fn process(&self, signature: &FailureSignature, now: DateTime<Utc>) -> PipelineOutcome {
        let agent_id = signature.agent_id.as_str();
        let candidates = generate(signature, &self.policy);
        let mut outcome = PipelineOutcome {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            debug!(agent_id, "No improvement candidates for signature");
            return outcome;
        }

        let decision = self.gate.evaluate(candidates, now).await;
        if !decision.surfaced.is_empty() {
            let items: Vec<String> = decision
                .surfaced
                .iter()
                .map(|c| format!("{} ({} risk): {}", c.kind, c.risk_tier, c.rationale))
                .collect();
            let message = format!("Manual review needed: {}", items.join("; "));
            if let Err(e) = self.notifier.notify(agent_id, &message).await {
                debug!("Notifier failed: {}", e);
            }
        }
        outcome.manual_review = decision.manual_review;
        outcome.rejected = decision.rejected;

        let Some(candidate) = decision.admitted else {
            return outcome;
        };

        let mut record = self.applier.apply(&candidate, now).await;
        if record.status == ImprovementStatus::ApplyFailed {
            self.gate.refund(agent_id).await;
            outcome.applied = Some(record);
            return outcome;
        }

        let baseline = match self.validator.collect_baseline(agent_id, record.applied_at).await {
            Ok(records) => WindowStats::from_records(&records),
            Err(e) => {
                warn!(agent_id, "Baseline scan failed, validating against an empty baseline: {}", e);
                WindowStats::default()
            }
        };
        record.baseline_stats = Some(baseline);
        if let Err(e) = self.applier.persist(&record).await {
            warn!(agent_id, record_id = %record.id, "Failed to append fix history: {}", e);
        }

        self.start_validation(record.clone()).await;
        outcome.applied = Some(record);
        outcome
    }

    /// Mark the record pending and spawn its treatment watcher
    pub async fn start_validation(&self, record: AppliedImprovementRecord) {
        let agent_id = record.agent_id.clone();
        let record_id = record.id.clone();
        self.gate.set_pending(&agent_id, &record_id).await;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (resolved_tx, resolved_rx) = watch::channel(None);
        let validator = self.validator.clone();
        let gate = self.gate.clone();

        let mut registry = self.watchers.lock().await;
        let handle = tokio::spawn({
            let agent_id = agent_id.clone();
            let record_id = record_id.clone();
            async move {
                let resolved = validator.validate(record, cancel_rx).await;
                gate.clear_pending(&agent_id, &record_id).await;
                resolved_tx.send_replace(Some(resolved));
            }
        });
        let replaced = registry.insert(
            agent_id.clone(),
            Watcher {
                record_id: record_id.clone(),
                cancel: Some(cancel_tx),
                resolved: resolved_rx,
                handle,
            },
        );
        if let Some(previous) = replaced.filter(|w| w.resolved.borrow().is_none()) {
            warn!(agent_id = %agent_id, record_id = %previous.record_id, "Replacing an existing validation watcher");
        }
        info!(agent_id = %agent_id, record_id = %record_id, "Validation watcher started");
    }

    /// Restart watchers for records still pending in the fix history
    pub async fn resume_pending(&self) -> StoreResult<usize> {
        let pending: Vec<_> = self
            .applier
            .history(None)
            .await?
            .into_iter()
            .filter(|r| r.status == ImprovementStatus::PendingValidation)
            .collect();
        let count = pending.len();
        for record in pending {
            info!(agent_id = %record.agent_id, record_id = %record.id, "Resuming validation");
            self.start_validation(record).await;
        }
        Ok(count)
    }

    /// Stop an in-flight validation; it resolves as a cancelled rollback
    pub async fn cancel_validation(&self, agent_id: &str) -> bool {
        let mut registry = self.watchers.lock().await;
        let Some(watcher) = registry.get_mut(agent_id) else {
            return false;
        };
        match watcher.cancel.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Wait for the agent's latest validation to resolve and return it. The
    /// watcher stays registered, and cancellable, until it resolves; it is
    /// forgotten once awaited.
    pub async fn await_validation(&self, agent_id: &str) -> Option<AppliedImprovementRecord> {
        let (record_id, mut resolved) = {
            let registry = self.watchers.lock().await;
            let watcher = registry.get(agent_id)?;
            (watcher.record_id.clone(), watcher.resolved.clone())
        };
        let record = match resolved.wait_for(|r| r.is_some()).await {
            Ok(record) => (*record).clone(),
            Err(_) => {
                warn!(agent_id, "Validation watcher ended without resolving");
                None
            }
        };

        let mut registry = self.watchers.lock().await;
        if registry.get(agent_id).map_or(false, |w| w.record_id == record_id) {
            registry.remove(agent_id);
        }
        record
    }

    /// Agents with an unresolved validation
    pub async fn validating(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .watchers
            .lock()
            .await
            .iter()
            .filter(|(_, w)| w.resolved.borrow().is_none())
            .map(|(agent_id, _)| agent_id.clone())
            .collect();
        agents.sort();
        agents
    }

    /// Abort every watcher. Their records stay pending and resume on next start.
    pub async fn abort_all(&self) {
        for (agent_id, watcher) in self.watchers.lock().await.drain() {
            debug!(agent_id = %agent_id, "Aborting validation watcher");
            watcher.handle.abort();
        }
    }
}
