//! Shared types used across modules
//!
//! This module contains the data model shared by the recorder, the
//! improvement pipeline and the query surface, kept here to avoid
//! circular dependencies between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Error kind assigned when a failure carries no usable classification
pub const UNKNOWN_ERROR_KIND: &str = "unknown";

/// Task category used when the context does not name one
pub const DEFAULT_CATEGORY: &str = "general";

/// Agent configuration as held by the configuration store
pub type AgentConfig = serde_json::Map<String, serde_json::Value>;

/// An immutable fact about one completed task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique ID for this execution
    #[serde(default)]
    pub id: String,
    /// When the execution completed
    pub timestamp: DateTime<Utc>,
    /// Agent that ran the task
    pub agent_id: String,
    /// Task description as supplied by the caller
    #[serde(rename = "task")]
    pub task_description: String,
    /// Whether execution succeeded
    pub success: bool,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Opaque caller context
    #[serde(default)]
    pub context: serde_json::Value,
    /// Classified failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ExecutionRecord {
    /// Error kind for analysis purposes.
    ///
    /// Prefers the explicit `error_kind`, then a string `error_kind` entry in
    /// the context. A context that is not a JSON object is treated as
    /// unparsable and yields [`UNKNOWN_ERROR_KIND`].
    pub fn resolved_error_kind(&self) -> String {
        if let Some(kind) = self.error_kind.as_deref().filter(|k| !k.trim().is_empty()) {
            return kind.trim().to_lowercase();
        }
        self.context
            .as_object()
            .and_then(|ctx| ctx.get("error_kind"))
            .and_then(|v| v.as_str())
            .filter(|k| !k.trim().is_empty())
            .map(|k| k.trim().to_lowercase())
            .unwrap_or_else(|| UNKNOWN_ERROR_KIND.to_string())
    }

    /// Task category used for duration percentiles
    pub fn category(&self) -> String {
        self.context
            .as_object()
            .and_then(|ctx| ctx.get("category"))
            .and_then(|v| v.as_str())
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CATEGORY)
            .to_string()
    }
}

/// What the caller hands to the recorder for a finished task
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub duration: Duration,
    pub error_kind: Option<String>,
    pub context: serde_json::Value,
}

impl ExecutionOutcome {
    pub fn success(duration: Duration) -> Self {
        Self {
            success: true,
            duration,
            ..Default::default()
        }
    }

    pub fn failure(duration: Duration, error_kind: impl Into<String>) -> Self {
        Self {
            success: false,
            duration,
            error_kind: Some(error_kind.into()),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Kinds of configuration change the loop can propose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImprovementKind {
    TimeoutIncrease,
    RetryAdd,
    RateLimit,
    PriorityAdjust,
    MemoryTune,
    CodeChange,
    Restart,
    PromptChange,
}

impl std::fmt::Display for ImprovementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImprovementKind::TimeoutIncrease => write!(f, "timeout-increase"),
            ImprovementKind::RetryAdd => write!(f, "retry-add"),
            ImprovementKind::RateLimit => write!(f, "rate-limit"),
            ImprovementKind::PriorityAdjust => write!(f, "priority-adjust"),
            ImprovementKind::MemoryTune => write!(f, "memory-tune"),
            ImprovementKind::CodeChange => write!(f, "code-change"),
            ImprovementKind::Restart => write!(f, "restart"),
            ImprovementKind::PromptChange => write!(f, "prompt-change"),
        }
    }
}

/// Whether a candidate may be applied without a human in the loop.
///
/// Ordered so that `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    /// Only low-risk candidates are ever applied automatically
    pub fn auto_applicable(&self) -> bool {
        matches!(self, RiskTier::Low)
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskTier::Low => write!(f, "low"),
            RiskTier::Medium => write!(f, "medium"),
            RiskTier::High => write!(f, "high"),
        }
    }
}

/// A proposed, typed configuration change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementCandidate {
    pub id: String,
    pub agent_id: String,
    pub kind: ImprovementKind,
    pub risk_tier: RiskTier,
    pub rationale: String,
    /// Partial configuration merged over the current one on apply
    pub proposed_config_delta: AgentConfig,
}

/// Lifecycle of an applied improvement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImprovementStatus {
    PendingValidation,
    Committed,
    RolledBack,
    ApplyFailed,
}

impl ImprovementStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ImprovementStatus::PendingValidation)
    }
}

impl std::fmt::Display for ImprovementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImprovementStatus::PendingValidation => write!(f, "pending-validation"),
            ImprovementStatus::Committed => write!(f, "committed"),
            ImprovementStatus::RolledBack => write!(f, "rolled-back"),
            ImprovementStatus::ApplyFailed => write!(f, "apply-failed"),
        }
    }
}

/// Why a validation resolved the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionReason {
    /// Treatment window met the commit rule
    Passed,
    /// Treatment window measured worse than baseline
    Regression,
    /// Treatment window did not fill before the deadline
    Timeout,
    /// Watcher was cancelled, e.g. on agent removal
    Cancelled,
}

impl std::fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionReason::Passed => write!(f, "passed"),
            ResolutionReason::Regression => write!(f, "regression"),
            ResolutionReason::Timeout => write!(f, "timeout"),
            ResolutionReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Success rate and mean duration over a window of executions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub samples: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub mean_duration_ms: f64,
}

impl WindowStats {
    pub fn from_records(records: &[ExecutionRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let samples = records.len();
        let successes = records.iter().filter(|r| r.success).count();
        let total_ms: f64 = records.iter().map(|r| r.duration_ms as f64).sum();
        Self {
            samples,
            successes,
            success_rate: successes as f64 / samples as f64,
            mean_duration_ms: total_ms / samples as f64,
        }
    }
}

/// One applied improvement and everything needed to undo it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedImprovementRecord {
    pub id: String,
    pub agent_id: String,
    pub candidate: ImprovementCandidate,
    /// Configuration as read immediately before the write
    pub config_snapshot_before: AgentConfig,
    pub applied_at: DateTime<Utc>,
    pub status: ImprovementStatus,
    #[serde(default)]
    pub baseline_stats: Option<WindowStats>,
    #[serde(default)]
    pub treatment_stats: Option<WindowStats>,
    /// Set once validation resolves
    #[serde(default)]
    pub resolution: Option<ResolutionReason>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Error text for apply faults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Count per error kind, ordered for deterministic output
pub type ErrorKindCounts = BTreeMap<String, usize>;

#[cfg(test)]
mod tests {
    use super::*;

    fn record(context: serde_json::Value, error_kind: Option<&str>) -> ExecutionRecord {
        ExecutionRecord {
            id: "r1".to_string(),
            timestamp: Utc::now(),
            agent_id: "agent".to_string(),
            task_description: "task".to_string(),
            success: false,
            duration_ms: 10,
            context,
            error_kind: error_kind.map(String::from),
        }
    }

    #[test]
    fn test_error_kind_prefers_explicit_field() {
        let r = record(serde_json::json!({"error_kind": "oom"}), Some("Timeout"));
        assert_eq!(r.resolved_error_kind(), "timeout");
    }

    #[test]
    fn test_error_kind_falls_back_to_context() {
        let r = record(serde_json::json!({"error_kind": "rate_limit"}), None);
        assert_eq!(r.resolved_error_kind(), "rate_limit");
    }

    #[test]
    fn test_unparsable_context_is_unknown() {
        let r = record(serde_json::json!("not an object"), None);
        assert_eq!(r.resolved_error_kind(), UNKNOWN_ERROR_KIND);
        assert_eq!(r.category(), DEFAULT_CATEGORY);
    }

    #[test]
    fn test_record_serializes_trace_field_names() {
        let r = record(serde_json::json!({}), None);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("task").is_some());
        assert!(json.get("duration_ms").is_some());
        assert!(json.get("error_kind").is_none());
    }

    #[test]
    fn test_window_stats() {
        let mut records = Vec::new();
        for i in 0..4 {
            let mut r = record(serde_json::json!({}), None);
            r.success = i < 3;
            r.duration_ms = 100 * (i + 1);
            records.push(r);
        }
        let stats = WindowStats::from_records(&records);
        assert_eq!(stats.samples, 4);
        assert_eq!(stats.successes, 3);
        assert_eq!(stats.success_rate, 0.75);
        assert_eq!(stats.mean_duration_ms, 250.0);
        assert_eq!(WindowStats::from_records(&[]), WindowStats::default());
    }

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&ImprovementKind::TimeoutIncrease).unwrap();
        assert_eq!(json, "\"timeout-increase\"");
        assert_eq!(ImprovementKind::TimeoutIncrease.to_string(), "timeout-increase");
        assert!(RiskTier::Low < RiskTier::High);
    }
}
