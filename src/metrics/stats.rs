//! Read-side improvement statistics
//!
//! Everything here is derived from the trace log, the fix history and the
//! cooldown registry without touching any of them. `as_of` only positions
//! the analysis window; summaries carry absolute instants such as
//! `cooldown_until` rather than anything measured from the call time, so two
//! calls with no executions in between return identical output.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::StoreResult;
use crate::improvement::gate::CooldownGate;
use crate::store::{FixHistory, TraceLog};
use crate::types::{AppliedImprovementRecord, ImprovementStatus};

/// Improvement records by status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImprovementCounts {
    pub committed: usize,
    pub rolled_back: usize,
    pub pending_validation: usize,
    pub apply_failed: usize,
}

impl ImprovementCounts {
    fn tally<'a>(records: impl Iterator<Item = &'a AppliedImprovementRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.status {
                ImprovementStatus::Committed => counts.committed += 1,
                ImprovementStatus::RolledBack => counts.rolled_back += 1,
                ImprovementStatus::PendingValidation => counts.pending_validation += 1,
                ImprovementStatus::ApplyFailed => counts.apply_failed += 1,
            }
        }
        counts
    }
}

/// Per-agent summary over the analysis window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStats {
    pub agent_id: String,
    /// Successful executions in the window
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub success_rate: f64,
    pub last_improvement_at: Option<DateTime<Utc>>,
    /// End of the running or most recent cooldown
    pub cooldown_until: Option<DateTime<Utc>>,
    pub pending_validation: Option<String>,
    pub pending_review: usize,
    pub improvements: ImprovementCounts,
}

impl AgentStats {
    /// Seconds of cooldown left at `now`; zero once it has elapsed
    pub fn remaining_cooldown_secs(&self, now: DateTime<Utc>) -> i64 {
        self.cooldown_until
            .map(|until| (until - now).num_seconds().max(0))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalStats {
    pub total_agents: usize,
    pub total_executions: usize,
    pub total_committed: usize,
    pub agents_with_committed: Vec<String>,
    pub pending_review: usize,
    pub improvements: ImprovementCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum ImprovementStats {
    Agent(AgentStats),
    Global(GlobalStats),
}

pub struct StatsAggregator {
    log: Arc<dyn TraceLog>,
    history: Arc<dyn FixHistory>,
    gate: Arc<CooldownGate>,
    window: Duration,
}

impl StatsAggregator {
    pub fn new(log: Arc<dyn TraceLog>, history: Arc<dyn FixHistory>, gate: Arc<CooldownGate>, window: Duration) -> Self {
        Self {
            log,
            history,
            gate,
            window,
        }
    }

    /// Summary for one agent, or across all agents when `agent_id` is `None`
    pub async fn get_stats(&self, agent_id: Option<&str>, as_of: DateTime<Utc>) -> StoreResult<ImprovementStats> {
        match agent_id {
            Some(agent_id) => Ok(ImprovementStats::Agent(self.agent_stats(agent_id, as_of).await?)),
            None => Ok(ImprovementStats::Global(self.global_stats(as_of).await?)),
        }
    }

    pub async fn agent_stats(&self, agent_id: &str, as_of: DateTime<Utc>) -> StoreResult<AgentStats> {
        let records = self.log.scan(Some(agent_id), as_of - self.window, as_of).await?;
        let total = records.len();
        let completed = records.iter().filter(|r| r.success).count();

        let history = self.history.records().await?;
        let mine: Vec<_> = history.iter().filter(|r| r.agent_id == agent_id).collect();

        let state = self.gate.snapshot(agent_id).await;
        let last_improvement_at = state
            .as_ref()
            .and_then(|s| s.last_improvement_at)
            .or_else(|| mine.iter().map(|r| r.applied_at).max());
        let cooldown_until = state.as_ref().and_then(|s| s.locked_until());

        Ok(AgentStats {
            agent_id: agent_id.to_string(),
            completed,
            failed: total - completed,
            total,
            success_rate: if total == 0 { 0.0 } else { completed as f64 / total as f64 },
            last_improvement_at,
            cooldown_until,
            pending_validation: state.and_then(|s| s.pending_validation),
            pending_review: self.gate.pending_review(Some(agent_id)).await.len(),
            improvements: ImprovementCounts::tally(mine.into_iter()),
        })
    }

    pub async fn global_stats(&self, as_of: DateTime<Utc>) -> StoreResult<GlobalStats> {
        let records = self.log.scan(None, DateTime::<Utc>::MIN_UTC, as_of).await?;
        let history = self.history.records().await?;

        let mut agents: BTreeSet<String> = records.iter().map(|r| r.agent_id.clone()).collect();
        agents.extend(history.iter().map(|r| r.agent_id.clone()));

        let agents_with_committed: BTreeSet<String> = history
            .iter()
            .filter(|r| r.status == ImprovementStatus::Committed)
            .map(|r| r.agent_id.clone())
            .collect();
        let improvements = ImprovementCounts::tally(history.iter());

        Ok(GlobalStats {
            total_agents: agents.len(),
            total_executions: records.len(),
            total_committed: improvements.committed,
            agents_with_committed: agents_with_committed.into_iter().collect(),
            pending_review: self.gate.pending_review(None).await.len(),
            improvements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryFixHistory, MemoryTraceLog};
    use crate::types::{AgentConfig, ExecutionRecord, ImprovementCandidate, ImprovementKind, RiskTier};
    use serde_json::json;

    fn execution(agent: &str, at: DateTime<Utc>, success: bool) -> ExecutionRecord {
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: at,
            agent_id: agent.to_string(),
            task_description: "task".to_string(),
            success,
            duration_ms: 10,
            context: json!({}),
            error_kind: None,
        }
    }

    fn improvement(agent: &str, status: ImprovementStatus, at: DateTime<Utc>) -> AppliedImprovementRecord {
        AppliedImprovementRecord {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent.to_string(),
            candidate: ImprovementCandidate {
                id: "c".to_string(),
                agent_id: agent.to_string(),
                kind: ImprovementKind::RetryAdd,
                risk_tier: RiskTier::Low,
                rationale: String::new(),
                proposed_config_delta: AgentConfig::new(),
            },
            config_snapshot_before: AgentConfig::new(),
            applied_at: at,
            status,
            baseline_stats: None,
            treatment_stats: None,
            resolution: None,
            resolved_at: None,
            failure: None,
        }
    }

    #[tokio::test]
    async fn test_agent_stats_window_and_cooldown() {
        let log = Arc::new(MemoryTraceLog::new());
        let gate = Arc::new(CooldownGate::new(6));
        let stats = StatsAggregator::new(log.clone(), Arc::new(MemoryFixHistory::new()), gate.clone(), Duration::hours(24));
        let now = Utc::now();

        log.append(&execution("a", now - Duration::hours(30), false)).await.unwrap();
        log.append(&execution("a", now - Duration::hours(1), false)).await.unwrap();
        log.append(&execution("a", now - Duration::minutes(5), true)).await.unwrap();
        assert!(gate.try_acquire("a", now - Duration::hours(2)).await);

        let s = stats.agent_stats("a", now).await.unwrap();
        assert_eq!(s.total, 2);
        assert_eq!(s.completed, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.success_rate, 0.5);
        assert_eq!(s.remaining_cooldown_secs(now), 4 * 3600);
        assert_eq!(s.remaining_cooldown_secs(now + Duration::hours(5)), 0);
    }

    #[tokio::test]
    async fn test_stats_are_idempotent_and_side_effect_free() {
        let log = Arc::new(MemoryTraceLog::new());
        let gate = Arc::new(CooldownGate::new(6));
        let stats = StatsAggregator::new(log.clone(), Arc::new(MemoryFixHistory::new()), gate.clone(), Duration::hours(24));
        let now = Utc::now();
        log.append(&execution("agent-x", now, true)).await.unwrap();

        let first = stats.get_stats(Some("agent-x"), now).await.unwrap();
        let second = stats.get_stats(Some("agent-x"), now + Duration::milliseconds(5)).await.unwrap();
        assert_eq!(first, second);
        assert!(gate.agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_global_stats() {
        let log = Arc::new(MemoryTraceLog::new());
        let history = Arc::new(MemoryFixHistory::new());
        let gate = Arc::new(CooldownGate::new(6));
        let stats = StatsAggregator::new(log.clone(), history.clone(), gate, Duration::hours(24));
        let now = Utc::now();

        log.append(&execution("a", now, true)).await.unwrap();
        log.append(&execution("b", now, false)).await.unwrap();
        history.append(&improvement("b", ImprovementStatus::Committed, now)).await.unwrap();
        history.append(&improvement("c", ImprovementStatus::RolledBack, now)).await.unwrap();

        let ImprovementStats::Global(g) = stats.get_stats(None, now).await.unwrap() else {
            panic!("expected global stats");
        };
        assert_eq!(g.total_agents, 3);
        assert_eq!(g.total_committed, 1);
        assert_eq!(g.agents_with_committed, vec!["b".to_string()]);
        assert_eq!(g.improvements.rolled_back, 1);
    }
}
