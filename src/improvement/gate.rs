//! Cooldown & risk gate
//!
//! Decides per agent whether a candidate may be applied now. Each agent moves
//! through `Idle -> Eligible -> Locked(until) -> Idle`:
//! - `Idle`: no cooldown pending
//! - `Eligible`: a failure trigger fired and the cooldown has expired
//! - `Locked(until)`: an application was attempted at `until - cooldown`
//!
//! The lock is taken optimistically on the attempt, not on success, so two
//! concurrent triggers for one agent cannot both apply. Apply faults hand the
//! slot back through [`CooldownGate::refund`]. Each agent has its own mutex;
//! different agents never contend.
//!
//! Medium and high risk candidates never reach the lock. They are queued for
//! manual review and never consume a cooldown slot. Instead the agent is
//! stamped `review_surfaced_at`, and the analyzer holds further triggers from
//! the same window while those items are still queued.
//!
//! State changes land in an in-memory mirror under the agent's lock; the
//! mirror is written to disk after the lock is released, and concurrent
//! writes coalesce into one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::types::{ImprovementCandidate, ImprovementKind};

/// Persisted per-agent cooldown state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCooldownState {
    pub agent_id: String,
    pub last_improvement_at: Option<DateTime<Utc>>,
    pub cooldown_hours: u64,
    /// Set when the analyzer fires, cleared when a lock is taken
    #[serde(default)]
    pub triggered_at: Option<DateTime<Utc>>,
    /// Applied improvement currently awaiting validation
    #[serde(default)]
    pub pending_validation: Option<String>,
    /// `last_improvement_at` before the most recent acquire, for refunds
    #[serde(default)]
    previous_improvement_at: Option<DateTime<Utc>>,
    /// When candidates were last routed to manual review
    #[serde(default)]
    pub review_surfaced_at: Option<DateTime<Utc>>,
}

impl AgentCooldownState {
    fn new(agent_id: &str, cooldown_hours: u64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            last_improvement_at: None,
            cooldown_hours,
            triggered_at: None,
            pending_validation: None,
            previous_improvement_at: None,
            review_surfaced_at: None,
        }
    }

    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        self.last_improvement_at
            .map(|at| at + Duration::hours(self.cooldown_hours as i64))
    }

    pub fn state(&self, now: DateTime<Utc>) -> GateState {
        match self.locked_until() {
            Some(until) if now < until => GateState::Locked { until },
            _ if self.triggered_at.is_some() => GateState::Eligible,
            _ => GateState::Idle,
        }
    }

    /// Cooldown running or a validation still pending
    pub fn blocks(&self, now: DateTime<Utc>) -> bool {
        self.pending_validation.is_some() || matches!(self.state(now), GateState::Locked { .. })
    }
}

/// Externally visible gate state for one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum GateState {
    Idle,
    Eligible,
    Locked { until: DateTime<Utc> },
}

/// Why the gate turned a candidate away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Agent is locked or has a validation pending
    CooldownActive,
    /// Kind disabled by configuration
    KindDisabled,
    /// Candidate proposes no change
    EmptyDelta,
}

/// Outcome of running a ranked candidate list through the gate
#[derive(Debug, Default)]
pub struct GateDecision {
    /// The one candidate cleared for application; its agent is now locked
    pub admitted: Option<ImprovementCandidate>,
    /// Medium/high risk candidates routed to manual review
    pub manual_review: Vec<ImprovementCandidate>,
    /// The part of `manual_review` not already queued; only these are announced
    pub surfaced: Vec<ImprovementCandidate>,
    /// Low risk candidates turned away, in rank order
    pub rejected: Vec<(ImprovementCandidate, RejectReason)>,
}

/// Candidate waiting for a human decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub candidate: ImprovementCandidate,
    pub queued_at: DateTime<Utc>,
}

/// Process-wide registry of per-agent cooldown state
pub struct CooldownGate {
    agents: RwLock<HashMap<String, Arc<Mutex<AgentCooldownState>>>>,
    default_cooldown_hours: u64,
    disabled_kinds: Vec<ImprovementKind>,
    review: Mutex<Vec<ReviewItem>>,
    persist_path: Option<PathBuf>,
    /// Mirror of every agent's state; never held across file I/O
    persisted: Mutex<Mirror>,
    /// Generation last written to disk; serializes writers
    written: Mutex<u64>,
}

#[derive(Default)]
struct Mirror {
    agents: HashMap<String, AgentCooldownState>,
    generation: u64,
}

impl CooldownGate {
    pub fn new(default_cooldown_hours: u64) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            default_cooldown_hours,
            disabled_kinds: Vec::new(),
            review: Mutex::new(Vec::new()),
            persist_path: None,
            persisted: Mutex::new(Mirror::default()),
            written: Mutex::new(0),
        }
    }

    pub fn with_disabled_kinds(mut self, kinds: Vec<ImprovementKind>) -> Self {
        self.disabled_kinds = kinds;
        self
    }

    /// Open a gate persisted at `path`, restoring any saved cooldowns
    pub async fn open(path: impl Into<PathBuf>, default_cooldown_hours: u64) -> StoreResult<Self> {
        let path = path.into();
        let saved: HashMap<String, AgentCooldownState> = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let agents = saved
            .iter()
            .map(|(id, state)| (id.clone(), Arc::new(Mutex::new(state.clone()))))
            .collect();
        if !saved.is_empty() {
            info!("Restored cooldown state for {} agents from {:?}", saved.len(), path);
        }

        Ok(Self {
            agents: RwLock::new(agents),
            default_cooldown_hours,
            disabled_kinds: Vec::new(),
            review: Mutex::new(Vec::new()),
            persist_path: Some(path),
            persisted: Mutex::new(Mirror {
                agents: saved,
                generation: 0,
            }),
            written: Mutex::new(0),
        })
    }

    /// Get or create the state handle for an agent
    async fn entry(&self, agent_id: &str) -> Arc<Mutex<AgentCooldownState>> {
        if let Some(entry) = self.agents.read().await.get(agent_id) {
            return entry.clone();
        }
        let mut agents = self.agents.write().await;
        agents
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                debug!(agent_id, "First sighting, creating cooldown state");
                Arc::new(Mutex::new(AgentCooldownState::new(agent_id, self.default_cooldown_hours)))
            })
            .clone()
    }

    async fn existing(&self, agent_id: &str) -> Option<Arc<Mutex<AgentCooldownState>>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Copy an agent's state into the mirror. Called under the agent's lock;
    /// returns the generation to hand to [`flush`](Self::flush) once it is released.
    async fn stage(&self, state: &AgentCooldownState) -> u64 {
        let mut mirror = self.persisted.lock().await;
        mirror.agents.insert(state.agent_id.clone(), state.clone());
        mirror.generation += 1;
        mirror.generation
    }

    /// Best-effort write of the mirror, unless a later write already covered `generation`
    async fn flush(&self, generation: u64) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let mut written = self.written.lock().await;
        if *written >= generation {
            return;
        }
        let snapshot = {
            let mirror = self.persisted.lock().await;
            serde_json::to_string_pretty(&mirror.agents).map(|json| (json, mirror.generation))
        };
        let result = async {
            let (json, latest) = snapshot?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, path).await?;
            Ok::<u64, StoreError>(latest)
        }
        .await;
        match result {
            Ok(latest) => *written = latest,
            Err(e) => warn!(path = ?path, "Failed to persist cooldown state: {}", e),
        }
    }

    /// Current state, or `Idle` for an agent never seen
    pub async fn state(&self, agent_id: &str, now: DateTime<Utc>) -> GateState {
        match self.existing(agent_id).await {
            Some(entry) => entry.lock().await.state(now),
            None => GateState::Idle,
        }
    }

    /// Whether a new improvement attempt would be refused right now
    pub async fn cooldown_active(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        match self.existing(agent_id).await {
            Some(entry) => entry.lock().await.blocks(now),
            None => false,
        }
    }

    pub async fn snapshot(&self, agent_id: &str) -> Option<AgentCooldownState> {
        match self.existing(agent_id).await {
            Some(entry) => Some(entry.lock().await.clone()),
            None => None,
        }
    }

    pub async fn agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Record that the failure trigger fired (`Idle -> Eligible`)
    pub async fn mark_eligible(&self, agent_id: &str, now: DateTime<Utc>) {
        let entry = self.entry(agent_id).await;
        let mut state = entry.lock().await;
        if state.blocks(now) || state.triggered_at.is_some() {
            return;
        }
        state.triggered_at = Some(now);
        let generation = self.stage(&state).await;
        drop(state);
        self.flush(generation).await;
    }

    /// Atomically take the agent's improvement slot.
    ///
    /// Returns `false` while the agent is locked or has a validation pending.
    /// On success the agent is `Locked` until `now + cooldown_hours`.
    pub async fn try_acquire(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        let entry = self.entry(agent_id).await;
        let mut state = entry.lock().await;
        if state.blocks(now) {
            debug!(agent_id, state = ?state.state(now), "Gate refused improvement slot");
            return false;
        }
        state.previous_improvement_at = state.last_improvement_at;
        state.last_improvement_at = Some(now);
        state.triggered_at = None;
        let generation = self.stage(&state).await;
        info!(agent_id, until = ?state.locked_until(), "Gate locked agent for improvement");
        drop(state);
        self.flush(generation).await;
        true
    }

    /// Give back a slot taken by [`try_acquire`](Self::try_acquire) after an apply fault
    pub async fn refund(&self, agent_id: &str) {
        let Some(entry) = self.existing(agent_id).await else {
            return;
        };
        let mut state = entry.lock().await;
        state.last_improvement_at = state.previous_improvement_at.take();
        let generation = self.stage(&state).await;
        drop(state);
        self.flush(generation).await;
        info!(agent_id, "Cooldown refunded after apply fault");
    }

    /// Mark an applied improvement as awaiting validation
    pub async fn set_pending(&self, agent_id: &str, record_id: &str) {
        let entry = self.entry(agent_id).await;
        let mut state = entry.lock().await;
        state.pending_validation = Some(record_id.to_string());
        let generation = self.stage(&state).await;
        drop(state);
        self.flush(generation).await;
    }

    /// Clear the pending slot if it still holds `record_id`
    pub async fn clear_pending(&self, agent_id: &str, record_id: &str) {
        let Some(entry) = self.existing(agent_id).await else {
            return;
        };
        let mut state = entry.lock().await;
        if state.pending_validation.as_deref() == Some(record_id) {
            state.pending_validation = None;
            let generation = self.stage(&state).await;
            drop(state);
            self.flush(generation).await;
        }
    }

    /// Override the cooldown for one agent
    pub async fn set_cooldown_hours(&self, agent_id: &str, hours: u64) {
        let entry = self.entry(agent_id).await;
        let mut state = entry.lock().await;
        state.cooldown_hours = hours;
        let generation = self.stage(&state).await;
        drop(state);
        self.flush(generation).await;
    }

    /// Stamp the agent as having candidates routed to review at `now`
    async fn mark_review_surfaced(&self, agent_id: &str, now: DateTime<Utc>) {
        let entry = self.entry(agent_id).await;
        let mut state = entry.lock().await;
        state.review_surfaced_at = Some(now);
        let generation = self.stage(&state).await;
        drop(state);
        self.flush(generation).await;
    }

    /// Whether candidates surfaced at or after `since` are still queued for review
    pub async fn review_hold(&self, agent_id: &str, since: DateTime<Utc>) -> bool {
        let surfaced = match self.existing(agent_id).await {
            Some(entry) => entry.lock().await.review_surfaced_at,
            None => None,
        };
        match surfaced {
            Some(at) if at >= since => self
                .review
                .lock()
                .await
                .iter()
                .any(|item| item.candidate.agent_id == agent_id),
            _ => false,
        }
    }

    /// Administrative removal of an agent's state and review items
    pub async fn remove_agent(&self, agent_id: &str) -> bool {
        let removed = self.agents.write().await.remove(agent_id).is_some();
        self.review.lock().await.retain(|item| item.candidate.agent_id != agent_id);
        if removed {
            let generation = {
                let mut mirror = self.persisted.lock().await;
                mirror.agents.remove(agent_id);
                mirror.generation += 1;
                mirror.generation
            };
            self.flush(generation).await;
            info!(agent_id, "Removed agent from cooldown registry");
        }
        removed
    }

    /// Run ranked candidates through the risk and cooldown checks.
    ///
    /// Walks the list best-first. Medium/high risk candidates go to manual
    /// review. The first low risk candidate that passes takes the agent's
    /// slot; rejected ones fall through to the next.
    pub async fn evaluate(&self, candidates: Vec<ImprovementCandidate>, now: DateTime<Utc>) -> GateDecision {
        let mut decision = GateDecision::default();
        let mut lock_refused = false;

        for candidate in candidates {
            if !candidate.risk_tier.auto_applicable() {
                info!(
                    agent_id = %candidate.agent_id,
                    kind = %candidate.kind,
                    risk = %candidate.risk_tier,
                    "Candidate routed to manual review"
                );
                if self.queue_for_review(candidate.clone(), now).await {
                    decision.surfaced.push(candidate.clone());
                }
                decision.manual_review.push(candidate);
                continue;
            }
            if decision.admitted.is_some() {
                continue;
            }
            if self.disabled_kinds.contains(&candidate.kind) {
                decision.rejected.push((candidate, RejectReason::KindDisabled));
                continue;
            }
            if candidate.proposed_config_delta.is_empty() {
                decision.rejected.push((candidate, RejectReason::EmptyDelta));
                continue;
            }
            if lock_refused || !self.try_acquire(&candidate.agent_id, now).await {
                lock_refused = true;
                decision.rejected.push((candidate, RejectReason::CooldownActive));
                continue;
            }
            decision.admitted = Some(candidate);
        }

        if let Some(first) = decision.manual_review.first() {
            let agent_id = first.agent_id.clone();
            self.mark_review_surfaced(&agent_id, now).await;
        }
        decision
    }

    /// Queue a candidate, replacing any item of the same agent and kind.
    /// Returns `false` when such an item was already queued.
    async fn queue_for_review(&self, candidate: ImprovementCandidate, now: DateTime<Utc>) -> bool {
        let mut review = self.review.lock().await;
        let existing = review.iter_mut().find(|item| {
            item.candidate.agent_id == candidate.agent_id && item.candidate.kind == candidate.kind
        });
        match existing {
            Some(item) => {
                item.candidate = candidate;
                false
            }
            None => {
                review.push(ReviewItem { candidate, queued_at: now });
                true
            }
        }
    }

    /// Candidates awaiting manual review, optionally for one agent
    pub async fn pending_review(&self, agent_id: Option<&str>) -> Vec<ReviewItem> {
        self.review
            .lock()
            .await
            .iter()
            .filter(|item| agent_id.map_or(true, |a| item.candidate.agent_id == a))
            .cloned()
            .collect()
    }

    /// Drop a reviewed candidate from the queue
    pub async fn dismiss_review(&self, candidate_id: &str) -> bool {
        let mut review = self.review.lock().await;
        let before = review.len();
        review.retain(|item| item.candidate.id != candidate_id);
        review.len() < before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskTier;
    use serde_json::json;

    fn candidate(agent: &str, kind: ImprovementKind, risk: RiskTier) -> ImprovementCandidate {
        ImprovementCandidate {
            id: format!("{}:{}", agent, kind),
            agent_id: agent.to_string(),
            kind,
            risk_tier: risk,
            rationale: "test".to_string(),
            proposed_config_delta: json!({"k": 1}).as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_state_machine() {
        let gate = CooldownGate::new(6);
        let now = Utc::now();
        assert_eq!(gate.state("a", now).await, GateState::Idle);

        gate.mark_eligible("a", now).await;
        assert_eq!(gate.state("a", now).await, GateState::Eligible);

        assert!(gate.try_acquire("a", now).await);
        assert_eq!(
            gate.state("a", now).await,
            GateState::Locked { until: now + Duration::hours(6) }
        );
        assert_eq!(gate.state("a", now + Duration::hours(6)).await, GateState::Idle);
    }

    #[tokio::test]
    async fn test_locked_agent_refuses_until_cooldown_elapses() {
        let gate = CooldownGate::new(6);
        let applied = Utc::now() - Duration::hours(2);
        assert!(gate.try_acquire("a", applied).await);

        let now = applied + Duration::hours(2);
        assert!(!gate.try_acquire("a", now).await);
        assert!(!gate.try_acquire("a", now + Duration::hours(3) + Duration::minutes(59)).await);
        assert!(gate.try_acquire("a", now + Duration::hours(4)).await);
    }

    #[tokio::test]
    async fn test_refund_restores_previous() {
        let gate = CooldownGate::new(6);
        let now = Utc::now();
        assert!(gate.try_acquire("a", now).await);
        gate.refund("a").await;
        assert!(!gate.cooldown_active("a", now).await);
        assert!(gate.snapshot("a").await.unwrap().last_improvement_at.is_none());
    }

    #[tokio::test]
    async fn test_pending_blocks_even_after_cooldown() {
        let gate = CooldownGate::new(1);
        let now = Utc::now();
        assert!(gate.try_acquire("a", now).await);
        gate.set_pending("a", "fix-1").await;
        assert!(!gate.try_acquire("a", now + Duration::hours(2)).await);

        gate.clear_pending("a", "other").await;
        assert!(gate.cooldown_active("a", now + Duration::hours(2)).await);
        gate.clear_pending("a", "fix-1").await;
        assert!(gate.try_acquire("a", now + Duration::hours(2)).await);
    }

    #[tokio::test]
    async fn test_agents_are_independent() {
        let gate = CooldownGate::new(6);
        let now = Utc::now();
        assert!(gate.try_acquire("a", now).await);
        assert!(gate.try_acquire("b", now).await);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let gate = Arc::new(CooldownGate::new(6));
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.try_acquire("coder-001", now).await }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_evaluate_routes_high_risk_to_review() {
        let gate = CooldownGate::new(6);
        let now = Utc::now();
        let decision = gate
            .evaluate(vec![candidate("a", ImprovementKind::CodeChange, RiskTier::High)], now)
            .await;
        assert!(decision.admitted.is_none());
        assert_eq!(decision.manual_review.len(), 1);
        assert_eq!(decision.surfaced.len(), 1);
        assert!(!gate.cooldown_active("a", now).await);
        assert_eq!(gate.pending_review(Some("a")).await.len(), 1);

        // Same kind again replaces rather than duplicates, and is not announced again
        let again = gate
            .evaluate(vec![candidate("a", ImprovementKind::CodeChange, RiskTier::High)], now)
            .await;
        assert_eq!(again.manual_review.len(), 1);
        assert!(again.surfaced.is_empty());
        assert_eq!(gate.pending_review(None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_evaluate_falls_through_disabled_kind() {
        let gate = CooldownGate::new(6).with_disabled_kinds(vec![ImprovementKind::TimeoutIncrease]);
        let now = Utc::now();
        let decision = gate
            .evaluate(
                vec![
                    candidate("a", ImprovementKind::TimeoutIncrease, RiskTier::Low),
                    candidate("a", ImprovementKind::RetryAdd, RiskTier::Low),
                ],
                now,
            )
            .await;
        assert_eq!(decision.admitted.unwrap().kind, ImprovementKind::RetryAdd);
        assert_eq!(decision.rejected[0].1, RejectReason::KindDisabled);
    }

    #[tokio::test]
    async fn test_evaluate_rejects_when_locked() {
        let gate = CooldownGate::new(6);
        let now = Utc::now();
        assert!(gate.try_acquire("a", now).await);
        let decision = gate
            .evaluate(
                vec![
                    candidate("a", ImprovementKind::TimeoutIncrease, RiskTier::Low),
                    candidate("a", ImprovementKind::RetryAdd, RiskTier::Low),
                ],
                now,
            )
            .await;
        assert!(decision.admitted.is_none());
        assert_eq!(decision.rejected.len(), 2);
        assert!(decision.rejected.iter().all(|(_, r)| *r == RejectReason::CooldownActive));
    }

    #[tokio::test]
    async fn test_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let now = Utc::now();
        {
            let gate = CooldownGate::open(&path, 6).await.unwrap();
            assert!(gate.try_acquire("coder-001", now).await);
        }
        let reopened = CooldownGate::open(&path, 6).await.unwrap();
        assert!(reopened.cooldown_active("coder-001", now + Duration::hours(1)).await);
        assert!(!reopened.try_acquire("coder-001", now + Duration::hours(1)).await);
    }

    #[tokio::test]
    async fn test_remove_agent() {
        let gate = CooldownGate::new(6);
        let now = Utc::now();
        assert!(gate.try_acquire("a", now).await);
        assert!(gate.remove_agent("a").await);
        assert!(!gate.cooldown_active("a", now).await);
        assert!(!gate.remove_agent("a").await);
    }

    #[tokio::test]
    async fn test_review_hold_lasts_while_items_queued() {
        let gate = CooldownGate::new(6);
        let now = Utc::now();
        assert!(!gate.review_hold("a", now - Duration::hours(24)).await);

        let decision = gate
            .evaluate(vec![candidate("a", ImprovementKind::CodeChange, RiskTier::High)], now)
            .await;
        assert_eq!(gate.snapshot("a").await.unwrap().review_surfaced_at, Some(now));
        assert!(gate.review_hold("a", now - Duration::hours(24)).await);
        assert!(!gate.review_hold("a", now + Duration::seconds(1)).await);
        assert!(!gate.review_hold("b", now - Duration::hours(24)).await);

        assert!(gate.dismiss_review(&decision.manual_review[0].id).await);
        assert!(!gate.review_hold("a", now - Duration::hours(24)).await);
    }

    #[tokio::test]
    async fn test_concurrent_agents_all_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let now = Utc::now();
        {
            let gate = Arc::new(CooldownGate::open(&path, 6).await.unwrap());
            let mut handles = Vec::new();
            for i in 0..16 {
                let gate = gate.clone();
                handles.push(tokio::spawn(async move {
                    gate.try_acquire(&format!("agent-{}", i), now).await
                }));
            }
            for h in handles {
                assert!(h.await.unwrap());
            }
            gate.set_pending("agent-3", "fix-3").await;
        }

        let reopened = CooldownGate::open(&path, 6).await.unwrap();
        assert_eq!(reopened.agents().await.len(), 16);
        for i in 0..16 {
            assert!(reopened.cooldown_active(&format!("agent-{}", i), now).await);
        }
        let state = reopened.snapshot("agent-3").await.unwrap();
        assert_eq!(state.pending_validation.as_deref(), Some("fix-3"));
    }
}
