//! Execution metrics
//!
//! This module covers the read and write sides of execution data:
//! - Record task outcomes into the trace log
//! - Analyze recent failures per agent
//! - Summarize improvement state for reporting

pub mod analysis;
pub mod execution;
pub mod stats;

pub use analysis::{percentile, Analysis, FailureAnalyzer, FailureSignature, LatencyPercentiles};
pub use execution::OutcomeRecorder;
pub use stats::{AgentStats, GlobalStats, ImprovementCounts, ImprovementStats, StatsAggregator};
