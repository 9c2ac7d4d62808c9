//! Improvement generation
//!
//! Maps a [`FailureSignature`] to ranked [`ImprovementCandidate`]s. This is a
//! pure function of the signature and the policy: no clock, no randomness,
//! no store access. Candidate ids are derived from the agent, the kind and
//! the window end, so identical input always yields identical output.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::metrics::analysis::FailureSignature;
use crate::types::{AgentConfig, ImprovementCandidate, ImprovementKind, RiskTier};

/// Tunables for candidate generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorPolicy {
    /// Occurrences of one error kind before it is treated as a pattern
    pub min_repeats: usize,
    /// p95/p50 ratio above which a caching candidate is proposed
    pub latency_spread_ratio: f64,
    /// Samples needed in a category before its percentiles are trusted
    pub min_latency_samples: usize,
    /// Floor for proposed timeouts
    pub base_timeout_ms: u64,
    /// Distinct error kinds that suggest deprioritizing the agent
    pub diverse_failure_kinds: usize,
}

impl Default for GeneratorPolicy {
    fn default() -> Self {
        Self {
            min_repeats: 2,
            latency_spread_ratio: 3.0,
            min_latency_samples: 5,
            base_timeout_ms: 30_000,
            diverse_failure_kinds: 3,
        }
    }
}

impl GeneratorPolicy {
    pub fn from_config(config: &crate::config::ImproverConfig) -> Self {
        Self {
            latency_spread_ratio: config.latency_spread_ratio,
            ..Default::default()
        }
    }
}

/// Coarse classification of an error kind string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Timeout,
    RateLimited,
    Memory,
    Crash,
    Prompt,
    Code,
    /// Exceptions, network hiccups and anything unclassified
    Transient,
}

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed_out", "timed out", "deadline"];
const RATE_LIMIT_MARKERS: &[&str] = &["rate_limit", "rate limit", "ratelimit", "429", "throttl", "too_many_requests"];
const MEMORY_MARKERS: &[&str] = &["oom", "out_of_memory", "out of memory", "memory"];
const CRASH_MARKERS: &[&str] = &["crash", "hung", "unresponsive", "killed", "segfault"];
const PROMPT_MARKERS: &[&str] = &["prompt", "invalid_output", "parse", "format", "hallucinat"];
const CODE_MARKERS: &[&str] = &["syntax", "panic", "assert", "type_error", "logic", "compile"];

pub fn classify_error_kind(kind: &str) -> ErrorClass {
    let kind = kind.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| kind.contains(m));
    if has(TIMEOUT_MARKERS) {
        ErrorClass::Timeout
    } else if has(RATE_LIMIT_MARKERS) {
        ErrorClass::RateLimited
    } else if has(MEMORY_MARKERS) {
        ErrorClass::Memory
    } else if has(CRASH_MARKERS) {
        ErrorClass::Crash
    } else if has(CODE_MARKERS) {
        ErrorClass::Code
    } else if has(PROMPT_MARKERS) {
        ErrorClass::Prompt
    } else {
        ErrorClass::Transient
    }
}

struct Scored {
    candidate: ImprovementCandidate,
    dominant: bool,
    support: usize,
}

fn delta(value: serde_json::Value) -> AgentConfig {
    value.as_object().cloned().unwrap_or_default()
}

/// Generate ranked candidates, best first.
///
/// Ranking: lower risk first, then candidates addressing the dominant error
/// kind, then by how many failures support them. Each kind appears once.
pub fn generate(signature: &FailureSignature, policy: &GeneratorPolicy) -> Vec<ImprovementCandidate> {
    let agent_id = &signature.agent_id;
    let stamp = signature.window_end.timestamp_millis();
    let make = |kind: ImprovementKind, risk: RiskTier, rationale: String, delta: AgentConfig| ImprovementCandidate {
        id: format!("{}:{}:{}", agent_id, kind, stamp),
        agent_id: agent_id.clone(),
        kind,
        risk_tier: risk,
        rationale,
        proposed_config_delta: delta,
    };

    let mut scored: Vec<Scored> = Vec::new();
    let mut push = |candidate: ImprovementCandidate, dominant: bool, support: usize| {
        scored.push(Scored { candidate, dominant, support });
    };

    // BTreeMap iteration keeps this deterministic
    for (kind, &count) in &signature.grouped_error_kinds {
        if count < policy.min_repeats {
            continue;
        }
        let dominant = signature.dominant_error_kind.as_deref() == Some(kind.as_str());
        match classify_error_kind(kind) {
            ErrorClass::Timeout => {
                let timeout_ms = suggested_timeout_ms(signature, policy);
                push(
                    make(
                        ImprovementKind::TimeoutIncrease,
                        RiskTier::Low,
                        format!("{} '{}' failures in window; raise timeout to {}ms", count, kind, timeout_ms),
                        delta(json!({ "timeout_ms": timeout_ms })),
                    ),
                    dominant,
                    count,
                );
                push(
                    make(
                        ImprovementKind::RetryAdd,
                        RiskTier::Low,
                        format!("{} '{}' failures in window; retry with backoff", count, kind),
                        delta(json!({ "max_retries": 2, "retry_backoff_ms": 1000 })),
                    ),
                    dominant,
                    count,
                );
            }
            ErrorClass::RateLimited => {
                push(
                    make(
                        ImprovementKind::RateLimit,
                        RiskTier::Low,
                        format!("{} '{}' failures in window; throttle outgoing calls", count, kind),
                        delta(json!({ "rate_limit_per_minute": 30 })),
                    ),
                    dominant,
                    count,
                );
                push(
                    make(
                        ImprovementKind::RetryAdd,
                        RiskTier::Low,
                        format!("{} '{}' failures in window; retry with long backoff", count, kind),
                        delta(json!({ "max_retries": 3, "retry_backoff_ms": 5000 })),
                    ),
                    dominant,
                    count,
                );
            }
            ErrorClass::Transient => push(
                make(
                    ImprovementKind::RetryAdd,
                    RiskTier::Low,
                    format!("{} '{}' failures in window; add retries", count, kind),
                    delta(json!({ "max_retries": 3, "retry_backoff_ms": 500 })),
                ),
                dominant,
                count,
            ),
            ErrorClass::Memory => push(
                make(
                    ImprovementKind::MemoryTune,
                    RiskTier::Medium,
                    format!("{} '{}' failures in window; raise memory limit", count, kind),
                    delta(json!({ "memory_limit_mb": 4096 })),
                ),
                dominant,
                count,
            ),
            ErrorClass::Crash => push(
                make(
                    ImprovementKind::Restart,
                    RiskTier::Medium,
                    format!("{} '{}' failures in window; restart the agent", count, kind),
                    delta(json!({ "restart_requested": true })),
                ),
                dominant,
                count,
            ),
            ErrorClass::Prompt => push(
                make(
                    ImprovementKind::PromptChange,
                    RiskTier::Medium,
                    format!("{} '{}' failures in window; prompt needs revision", count, kind),
                    delta(json!({ "prompt_review_requested": kind })),
                ),
                dominant,
                count,
            ),
            ErrorClass::Code => push(
                make(
                    ImprovementKind::CodeChange,
                    RiskTier::High,
                    format!("{} '{}' failures in window; agent code needs a fix", count, kind),
                    delta(json!({ "code_review_requested": kind })),
                ),
                dominant,
                count,
            ),
        }
    }

    // Latency spread: cache the slowest category
    let worst_spread = signature
        .latency
        .iter()
        .filter(|(_, p)| p.samples >= policy.min_latency_samples && p.p50_ms > 0.0)
        .map(|(category, p)| (category, p.p95_ms / p.p50_ms))
        .filter(|(_, ratio)| *ratio > policy.latency_spread_ratio)
        .fold(None, |best: Option<(&String, f64)>, (category, ratio)| match best {
            Some((_, best_ratio)) if best_ratio >= ratio => best,
            _ => Some((category, ratio)),
        });
    if let Some((category, ratio)) = worst_spread {
        push(
            make(
                ImprovementKind::MemoryTune,
                RiskTier::Low,
                format!("p95/p50 latency ratio {:.1} for '{}'; enable result cache", ratio, category),
                delta(json!({ "cache_enabled": true, "cache_ttl_secs": 300 })),
            ),
            false,
            1,
        );
    }

    let distinct_kinds = signature.grouped_error_kinds.len();
    if distinct_kinds >= policy.diverse_failure_kinds {
        push(
            make(
                ImprovementKind::PriorityAdjust,
                RiskTier::Low,
                format!("{} distinct failure kinds in window; lower scheduling priority", distinct_kinds),
                delta(json!({ "priority": "low" })),
            ),
            false,
            signature.failure_count,
        );
    }

    // Stable sort keeps emission order among equals
    scored.sort_by(|a, b| {
        a.candidate
            .risk_tier
            .cmp(&b.candidate.risk_tier)
            .then(b.dominant.cmp(&a.dominant))
            .then(b.support.cmp(&a.support))
    });

    let mut seen = Vec::new();
    scored
        .into_iter()
        .filter(|s| {
            let key = (s.candidate.kind, s.candidate.risk_tier);
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        })
        .map(|s| s.candidate)
        .collect()
}

/// Twice the worst observed p95, rounded up to a whole second, never below the floor
fn suggested_timeout_ms(signature: &FailureSignature, policy: &GeneratorPolicy) -> u64 {
    let worst_p95 = signature
        .latency
        .values()
        .map(|p| p.p95_ms)
        .fold(0.0_f64, f64::max);
    let doubled = (worst_p95 * 2.0 / 1000.0).ceil() as u64 * 1000;
    doubled.max(policy.base_timeout_ms)
}
