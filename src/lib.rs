//! Agent Improve - self-improving execution control loop
//!
//! Wraps agent task execution and closes the loop on failures:
//! - Records every execution outcome in an append-only trace log
//! - Detects failure patterns per agent over a sliding window
//! - Proposes typed, risk-tiered configuration changes
//! - Applies low-risk changes under a per-agent cooldown
//! - Validates each change with a live A/B comparison and rolls back regressions
//!
//! # Example
//!
//! ```ignore
//! use agent_improve::config::ImproverConfig;
//! use agent_improve::supervisor::{Supervisor, TaskOutcome};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let supervisor = Supervisor::open(&ImproverConfig::default()).await?;
//!     let result = supervisor
//!         .execute_with_improvement(
//!             "coder-001",
//!             "build project",
//!             || async { Ok(TaskOutcome::success(serde_json::json!("done"))) },
//!             serde_json::json!({"category": "build"}),
//!         )
//!         .await;
//!     println!("{:?}", result);
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod error;
pub mod config;
pub mod store;
pub mod metrics;
pub mod improvement;
pub mod supervisor;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::ImproverConfig;
pub use error::{ImproveError, StoreError};
pub use improvement::{CooldownGate, GateState, ImprovementPipeline};
pub use metrics::{FailureAnalyzer, ImprovementStats, OutcomeRecorder};
pub use store::Stores;
pub use supervisor::{Supervisor, TaskOutcome, TaskResult};
pub use types::{
    AppliedImprovementRecord, ExecutionOutcome, ExecutionRecord, ImprovementCandidate, ImprovementKind,
    ImprovementStatus, RiskTier,
};
