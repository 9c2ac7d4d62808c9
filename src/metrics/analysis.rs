//! Failure pattern analysis
//!
//! Scans the analysis window of an agent's execution records and decides
//! whether the improvement pipeline should run.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::StoreResult;
use crate::improvement::gate::CooldownGate;
use crate::store::TraceLog;
use crate::types::{ErrorKindCounts, ExecutionRecord};

/// Rank-based duration percentiles for one task category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub samples: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

/// Derived summary of an agent's failures in a window. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSignature {
    pub agent_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// All executions in the window
    pub total_count: usize,
    pub failure_count: usize,
    pub grouped_error_kinds: ErrorKindCounts,
    /// Highest count; ties go to the most recent occurrence
    pub dominant_error_kind: Option<String>,
    /// Per task category, over every execution in the window
    pub latency: BTreeMap<String, LatencyPercentiles>,
}

impl FailureSignature {
    pub fn empty(agent_id: &str, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            window_start,
            window_end,
            total_count: 0,
            failure_count: 0,
            grouped_error_kinds: BTreeMap::new(),
            dominant_error_kind: None,
            latency: BTreeMap::new(),
        }
    }

    /// Build a signature from records already restricted to the window
    pub fn from_records(
        agent_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        records: &[ExecutionRecord],
    ) -> Self {
        let mut signature = Self::empty(agent_id, window_start, window_end);
        signature.total_count = records.len();

        let mut last_seen: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut durations: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for record in records {
            durations
                .entry(record.category())
                .or_default()
                .push(record.duration_ms as f64);

            if record.success {
                continue;
            }
            signature.failure_count += 1;
            let kind = record.resolved_error_kind();
            *signature.grouped_error_kinds.entry(kind.clone()).or_default() += 1;
            let seen = last_seen.entry(kind).or_insert(record.timestamp);
            if record.timestamp > *seen {
                *seen = record.timestamp;
            }
        }

        signature.dominant_error_kind = signature
            .grouped_error_kinds
            .iter()
            .max_by(|(ka, ca), (kb, cb)| ca.cmp(cb).then_with(|| last_seen[*ka].cmp(&last_seen[*kb])))
            .map(|(kind, _)| kind.clone());

        signature.latency = durations
            .into_iter()
            .map(|(category, mut values)| {
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let stats = LatencyPercentiles {
                    samples: values.len(),
                    p50_ms: percentile(&values, 50.0),
                    p95_ms: percentile(&values, 95.0),
                };
                (category, stats)
            })
            .collect();

        signature
    }
}

/// Percentile of already sorted values, interpolating linearly between the
/// two nearest ranks. Empty input yields 0.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

/// Result of one analysis pass
#[derive(Debug, Clone)]
pub struct Analysis {
    pub should_trigger: bool,
    /// Agent was locked or awaiting validation; the window was not scanned
    pub cooldown_active: bool,
    /// Candidates surfaced within the window still await review; not scanned
    pub review_pending: bool,
    pub signature: FailureSignature,
}

/// Failure pattern analyzer
pub struct FailureAnalyzer {
    log: Arc<dyn TraceLog>,
    gate: Arc<CooldownGate>,
    window: Duration,
    failure_threshold: usize,
}

impl FailureAnalyzer {
    pub fn new(log: Arc<dyn TraceLog>, gate: Arc<CooldownGate>, window: Duration, failure_threshold: usize) -> Self {
        Self {
            log,
            gate,
            window,
            failure_threshold,
        }
    }

    /// Analyze `[now - window, now]` for `agent_id`.
    ///
    /// Triggers when the window holds at least `failure_threshold` failures,
    /// the agent's cooldown is not active, and no candidate surfaced within
    /// the window is still waiting for review. Both holds are checked first
    /// so a held agent costs no scan.
    pub async fn analyze(&self, agent_id: &str, now: DateTime<Utc>) -> StoreResult<Analysis> {
        let window_start = now - self.window;

        if self.gate.cooldown_active(agent_id, now).await {
            debug!(agent_id, "Cooldown active, skipping failure analysis");
            return Ok(Analysis {
                should_trigger: false,
                cooldown_active: true,
                review_pending: false,
                signature: FailureSignature::empty(agent_id, window_start, now),
            });
        }

        if self.gate.review_hold(agent_id, window_start).await {
            debug!(agent_id, "Review pending for this window, skipping failure analysis");
            return Ok(Analysis {
                should_trigger: false,
                cooldown_active: false,
                review_pending: true,
                signature: FailureSignature::empty(agent_id, window_start, now),
            });
        }

        let records = self.log.scan(Some(agent_id), window_start, now).await?;
        let signature = FailureSignature::from_records(agent_id, window_start, now, &records);
        let should_trigger = signature.failure_count >= self.failure_threshold;

        debug!(
            agent_id,
            failures = signature.failure_count,
            total = signature.total_count,
            should_trigger,
            "Analyzed failure window"
        );

        Ok(Analysis {
            should_trigger,
            cooldown_active: false,
            review_pending: false,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTraceLog;
    use serde_json::json;

    fn record(at: DateTime<Utc>, success: bool, kind: Option<&str>, ms: u64) -> ExecutionRecord {
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: at,
            agent_id: "coder-001".to_string(),
            task_description: "task".to_string(),
            success,
            duration_ms: ms,
            context: json!({}),
            error_kind: kind.map(String::from),
        }
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 50.0), 25.0);
        assert!((percentile(&values, 95.0) - 38.5).abs() < 1e-9);
        assert_eq!(percentile(&values, 0.0), 10.0);
        assert_eq!(percentile(&values, 100.0), 40.0);
        assert_eq!(percentile(&[7.0], 95.0), 7.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_dominant_kind_tie_breaks_on_recency() {
        let now = Utc::now();
        let records = vec![
            record(now - Duration::minutes(50), false, Some("rate_limit"), 10),
            record(now - Duration::minutes(40), false, Some("timeout"), 10),
            record(now - Duration::minutes(30), false, Some("rate_limit"), 10),
            record(now - Duration::minutes(20), false, Some("timeout"), 10),
        ];
        let sig = FailureSignature::from_records("coder-001", now - Duration::hours(24), now, &records);
        assert_eq!(sig.failure_count, 4);
        assert_eq!(sig.dominant_error_kind.as_deref(), Some("timeout"));

        let mut more = records.clone();
        more.push(record(now - Duration::minutes(10), false, Some("rate_limit"), 10));
        let sig = FailureSignature::from_records("coder-001", now - Duration::hours(24), now, &more);
        assert_eq!(sig.dominant_error_kind.as_deref(), Some("rate_limit"));
    }

    #[test]
    fn test_malformed_context_counts_as_unknown() {
        let now = Utc::now();
        let mut bad = record(now, false, None, 10);
        bad.context = json!(["not", "an", "object"]);
        let sig = FailureSignature::from_records("coder-001", now - Duration::hours(1), now, &[bad]);
        assert_eq!(sig.grouped_error_kinds.get("unknown"), Some(&1));
    }

    #[test]
    fn test_latency_grouped_by_category() {
        let now = Utc::now();
        let mut records = Vec::new();
        for ms in [100, 200, 300] {
            let mut r = record(now, true, None, ms);
            r.context = json!({"category": "search"});
            records.push(r);
        }
        records.push(record(now, true, None, 50));
        let sig = FailureSignature::from_records("coder-001", now - Duration::hours(1), now, &records);
        assert_eq!(sig.latency["search"].samples, 3);
        assert_eq!(sig.latency["search"].p50_ms, 200.0);
        assert_eq!(sig.latency["general"].p95_ms, 50.0);
    }

    #[tokio::test]
    async fn test_trigger_needs_threshold_within_window() {
        let log = Arc::new(MemoryTraceLog::new());
        let gate = Arc::new(CooldownGate::new(6));
        let analyzer = FailureAnalyzer::new(log.clone(), gate.clone(), Duration::hours(24), 3);
        let now = Utc::now();

        log.append(&record(now - Duration::hours(30), false, Some("timeout"), 10)).await.unwrap();
        log.append(&record(now - Duration::hours(2), false, Some("timeout"), 10)).await.unwrap();
        log.append(&record(now - Duration::hours(1), false, Some("timeout"), 10)).await.unwrap();
        assert!(!analyzer.analyze("coder-001", now).await.unwrap().should_trigger);

        log.append(&record(now, false, Some("timeout"), 10)).await.unwrap();
        let analysis = analyzer.analyze("coder-001", now).await.unwrap();
        assert!(analysis.should_trigger);
        assert_eq!(analysis.signature.failure_count, 3);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_trigger() {
        let log = Arc::new(MemoryTraceLog::new());
        let gate = Arc::new(CooldownGate::new(6));
        let analyzer = FailureAnalyzer::new(log.clone(), gate.clone(), Duration::hours(24), 3);
        let now = Utc::now();
        for i in 0..5 {
            log.append(&record(now - Duration::minutes(i), false, Some("timeout"), 10)).await.unwrap();
        }
        assert!(gate.try_acquire("coder-001", now - Duration::hours(2)).await);

        let analysis = analyzer.analyze("coder-001", now).await.unwrap();
        assert!(!analysis.should_trigger);
        assert!(analysis.cooldown_active);
    }

    #[tokio::test]
    async fn test_queued_review_suppresses_trigger_for_window() {
        use crate::types::{ImprovementCandidate, ImprovementKind, RiskTier};

        let log = Arc::new(MemoryTraceLog::new());
        let gate = Arc::new(CooldownGate::new(6));
        let analyzer = FailureAnalyzer::new(log.clone(), gate.clone(), Duration::hours(24), 3);
        let now = Utc::now();
        for i in 0..4 {
            log.append(&record(now - Duration::minutes(i), false, Some("syntax_error"), 10)).await.unwrap();
        }
        assert!(analyzer.analyze("coder-001", now).await.unwrap().should_trigger);

        let review = ImprovementCandidate {
            id: "coder-001:code-change:0".to_string(),
            agent_id: "coder-001".to_string(),
            kind: ImprovementKind::CodeChange,
            risk_tier: RiskTier::High,
            rationale: "syntax errors".to_string(),
            proposed_config_delta: serde_json::Map::new(),
        };
        gate.evaluate(vec![review], now).await;

        let held = analyzer.analyze("coder-001", now + Duration::minutes(1)).await.unwrap();
        assert!(!held.should_trigger);
        assert!(held.review_pending);
        assert!(!held.cooldown_active);

        // Once the window has moved past the surfacing, failures count again
        log.append(&record(now + Duration::hours(25), false, Some("syntax_error"), 10)).await.unwrap();
        log.append(&record(now + Duration::hours(25), false, Some("syntax_error"), 10)).await.unwrap();
        log.append(&record(now + Duration::hours(25), false, Some("syntax_error"), 10)).await.unwrap();
        let later = analyzer.analyze("coder-001", now + Duration::hours(25)).await.unwrap();
        assert!(later.should_trigger);
    }
}
