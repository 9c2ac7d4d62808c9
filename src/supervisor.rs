//! Execution supervisor
//!
//! Entry point of the improvement loop. [`Supervisor::execute_with_improvement`]
//! runs a caller-supplied task, records its outcome, and runs the cheap
//! trigger check inline. When the check fires, the heavier
//! generate -> gate -> apply chain is queued for a background worker so the
//! caller's result is never delayed by it. At most one job per agent is
//! queued or running at a time.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ImproverConfig;
use crate::error::StoreResult;
use crate::improvement::{
    Applier, CooldownGate, GeneratorPolicy, ImprovementPipeline, ReviewItem, ValidationController,
    ValidationPolicy,
};
use crate::metrics::{FailureAnalyzer, FailureSignature, ImprovementStats, OutcomeRecorder, StatsAggregator};
use crate::store::{Stores, TraceLog, WindowedTraceLog};
use crate::types::{AppliedImprovementRecord, ExecutionOutcome};

/// Error kind recorded when a task returns `Err`
pub const EXCEPTION_ERROR_KIND: &str = "exception";
/// Error kind recorded when a task panics
pub const PANIC_ERROR_KIND: &str = "panic";

/// What a task executor reports
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    /// Falls back to the measured wall time when absent
    #[serde(default)]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub output: Value,
}

impl TaskOutcome {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    pub fn failure(error_kind: impl Into<String>) -> Self {
        Self {
            success: false,
            error_kind: Some(error_kind.into()),
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// What the caller gets back
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    /// None when the outcome could not be recorded
    pub record_id: Option<String>,
    pub success: bool,
    pub duration: Duration,
    pub error_kind: Option<String>,
    pub output: Value,
    /// Error or panic message of a faulted task
    pub error: Option<String>,
}

struct Job {
    signature: FailureSignature,
}

pub struct Supervisor {
    recorder: Arc<OutcomeRecorder>,
    analyzer: FailureAnalyzer,
    stats: StatsAggregator,
    pipeline: Arc<ImprovementPipeline>,
    jobs: mpsc::Sender<Job>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    worker: JoinHandle<()>,
}

impl Supervisor {
    /// Wire the loop over `stores`. Must be called inside a tokio runtime.
    ///
    /// Every read and write of the trace log goes through one
    /// [`WindowedTraceLog`], so the per-failure trigger check is served from
    /// memory.
    pub fn new(config: &ImproverConfig, stores: Stores, gate: CooldownGate) -> Self {
        let gate = Arc::new(gate.with_disabled_kinds(config.disabled_kinds.clone()));
        let trace: Arc<dyn TraceLog> = Arc::new(WindowedTraceLog::new(stores.trace.clone(), config.analysis_window()));
        let recorder = Arc::new(OutcomeRecorder::new(trace.clone()));
        let applier = Arc::new(Applier::new(stores.configs.clone(), stores.history.clone()));
        let validator = Arc::new(ValidationController::new(
            trace.clone(),
            recorder.events(),
            applier.clone(),
            stores.notifier.clone(),
            ValidationPolicy::from_config(config),
        ));
        let pipeline = Arc::new(ImprovementPipeline::new(
            gate.clone(),
            applier,
            validator,
            stores.notifier.clone(),
            GeneratorPolicy::from_config(config),
        ));
        let analyzer = FailureAnalyzer::new(
            trace.clone(),
            gate.clone(),
            config.analysis_window(),
            config.failure_threshold,
        );
        let stats = StatsAggregator::new(trace, stores.history.clone(), gate, config.analysis_window());

        let (jobs, rx) = mpsc::channel(config.queue_capacity.max(1));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let worker = tokio::spawn(run_worker(rx, pipeline.clone(), in_flight.clone()));

        Self {
            recorder,
            analyzer,
            stats,
            pipeline,
            jobs,
            in_flight,
            worker,
        }
    }

    /// In-memory stores and gate
    pub fn in_memory(config: &ImproverConfig) -> Self {
        Self::new(config, Stores::in_memory(), CooldownGate::new(config.cooldown_hours))
    }

    /// File-backed stores under the configured data dir. Validations left
    /// pending by a previous run are resumed.
    pub async fn open(config: &ImproverConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let dir = config.data_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let gate = CooldownGate::open(dir.join("cooldowns.json"), config.cooldown_hours).await?;
        let supervisor = Self::new(config, Stores::file_backed(&dir), gate);
        let resumed = supervisor.pipeline.resume_pending().await?;
        info!(data_dir = ?dir, resumed, "Improvement supervisor ready");
        Ok(supervisor)
    }

    /// Run `execute_fn`, record its outcome, and return its result.
    ///
    /// `Err` and panics from the task become failed results with error kind
    /// `exception` or `panic`; neither propagates. The improvement chain
    /// only ever runs in the background.
    pub async fn execute_with_improvement<F, Fut>(
        &self,
        agent_id: &str,
        task: &str,
        execute_fn: F,
        context: Value,
    ) -> TaskResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<TaskOutcome>>,
    {
        let started = Instant::now();
        let caught = AssertUnwindSafe(async move { execute_fn().await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let mut result = match caught {
            Ok(Ok(outcome)) => TaskResult {
                record_id: None,
                success: outcome.success,
                duration: outcome.duration.unwrap_or(elapsed),
                error_kind: if outcome.success { None } else { outcome.error_kind },
                output: outcome.output,
                error: None,
            },
            Ok(Err(e)) => TaskResult {
                record_id: None,
                success: false,
                duration: elapsed,
                error_kind: Some(EXCEPTION_ERROR_KIND.to_string()),
                output: Value::Null,
                error: Some(format!("{:#}", e)),
            },
            Err(panic) => TaskResult {
                record_id: None,
                success: false,
                duration: elapsed,
                error_kind: Some(PANIC_ERROR_KIND.to_string()),
                output: Value::Null,
                error: Some(panic_message(panic.as_ref())),
            },
        };

        let outcome = ExecutionOutcome {
            success: result.success,
            duration: result.duration,
            error_kind: result.error_kind.clone(),
            context,
        };
        match self.recorder.record(agent_id, task, outcome).await {
            Ok(id) => result.record_id = Some(id),
            Err(e) => {
                warn!(agent_id, "Execution not recorded: {}", e);
                return result;
            }
        }

        if !result.success {
            self.check_trigger(agent_id, Utc::now()).await;
        }
        result
    }

    /// Inline trigger check; queues a pipeline job when it fires
    async fn check_trigger(&self, agent_id: &str, now: DateTime<Utc>) {
        let analysis = match self.analyzer.analyze(agent_id, now).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(agent_id, "Failure analysis skipped: {}", e);
                return;
            }
        };
        if !analysis.should_trigger {
            return;
        }

        self.pipeline.gate().mark_eligible(agent_id, now).await;

        let mut in_flight = self.in_flight.lock().await;
        if !in_flight.insert(agent_id.to_string()) {
            debug!(agent_id, "Improvement already queued");
            return;
        }
        let failures = analysis.signature.failure_count;
        match self.jobs.try_send(Job {
            signature: analysis.signature,
        }) {
            Ok(()) => info!(agent_id, failures, "Queued improvement job"),
            Err(e) => {
                in_flight.remove(agent_id);
                warn!(agent_id, "Improvement queue refused job: {}", e);
            }
        }
    }

    /// Read-only summary; repeated calls with no executions in between are equal
    pub async fn get_improvement_stats(&self, agent_id: Option<&str>) -> StoreResult<ImprovementStats> {
        self.stats.get_stats(agent_id, Utc::now()).await
    }

    /// Stats with the analysis window ending at `as_of`
    pub async fn get_improvement_stats_at(
        &self,
        agent_id: Option<&str>,
        as_of: DateTime<Utc>,
    ) -> StoreResult<ImprovementStats> {
        self.stats.get_stats(agent_id, as_of).await
    }

    /// Candidates awaiting manual review
    pub async fn pending_review(&self, agent_id: Option<&str>) -> Vec<ReviewItem> {
        self.pipeline.gate().pending_review(agent_id).await
    }

    /// Administrative removal: cancels any validation (rolling it back),
    /// then drops the agent's cooldown state and review items
    pub async fn remove_agent(&self, agent_id: &str) -> Option<AppliedImprovementRecord> {
        let resolved = if self.pipeline.cancel_validation(agent_id).await {
            self.pipeline.await_validation(agent_id).await
        } else {
            None
        };
        self.pipeline.gate().remove_agent(agent_id).await;
        info!(agent_id, "Agent removed from improvement loop");
        resolved
    }

    /// Wait for the agent's in-flight validation to resolve
    pub async fn await_validation(&self, agent_id: &str) -> Option<AppliedImprovementRecord> {
        self.pipeline.await_validation(agent_id).await
    }

    /// Agents with a queued or running pipeline job
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub fn recorder(&self) -> &Arc<OutcomeRecorder> {
        &self.recorder
    }

    pub fn pipeline(&self) -> &Arc<ImprovementPipeline> {
        &self.pipeline
    }

    /// Stop the worker and abort validation watchers. Pending validations
    /// stay pending in the fix history.
    pub async fn shutdown(&self) {
        self.worker.abort();
        self.pipeline.abort_all().await;
        info!("Improvement supervisor stopped");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Job>,
    pipeline: Arc<ImprovementPipeline>,
    in_flight: Arc<Mutex<HashSet<String>>>,
) {
    while let Some(job) = rx.recv().await {
        let pipeline = pipeline.clone();
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let agent_id = job.signature.agent_id.clone();
            let outcome = pipeline.process(&job.signature, Utc::now()).await;
            debug!(
                agent_id = %agent_id,
                candidates = outcome.candidates,
                applied = outcome.applied.is_some(),
                review = outcome.manual_review.len(),
                "Improvement job finished"
            );
            in_flight.lock().await.remove(&agent_id);
        });
    }
    debug!("Improvement worker exiting");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn explode() -> anyhow::Result<TaskOutcome> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_success_returns_output() {
        let supervisor = Supervisor::in_memory(&ImproverConfig::default());
        let result = supervisor
            .execute_with_improvement(
                "coder-001",
                "build",
                || async { Ok(TaskOutcome::success(json!({"artifact": "bin"}))) },
                json!({}),
            )
            .await;
        assert!(result.success);
        assert!(result.record_id.is_some());
        assert_eq!(result.output["artifact"], "bin");
    }

    #[tokio::test]
    async fn test_err_and_panic_become_failures() {
        let supervisor = Supervisor::in_memory(&ImproverConfig::default());
        let failed = supervisor
            .execute_with_improvement(
                "coder-001",
                "build",
                || async { Err(anyhow::anyhow!("connection reset")) },
                json!({}),
            )
            .await;
        assert!(!failed.success);
        assert_eq!(failed.error_kind.as_deref(), Some(EXCEPTION_ERROR_KIND));
        assert!(failed.error.unwrap().contains("connection reset"));

        let panicked = supervisor
            .execute_with_improvement(
                "coder-001",
                "build",
                explode,
                json!({}),
            )
            .await;
        assert_eq!(panicked.error_kind.as_deref(), Some(PANIC_ERROR_KIND));
        assert_eq!(panicked.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_empty_agent_still_returns_result() {
        let supervisor = Supervisor::in_memory(&ImproverConfig::default());
        let result = supervisor
            .execute_with_improvement("", "build", || async { Ok(TaskOutcome::success(json!(1))) }, json!({}))
            .await;
        assert!(result.success);
        assert!(result.record_id.is_none());
    }

    #[tokio::test]
    async fn test_reported_duration_wins() {
        let supervisor = Supervisor::in_memory(&ImproverConfig::default());
        let result = supervisor
            .execute_with_improvement(
                "a",
                "t",
                || async { Ok(TaskOutcome::success(Value::Null).with_duration(Duration::from_millis(1234))) },
                json!({}),
            )
            .await;
        assert_eq!(result.duration, Duration::from_millis(1234));
    }
}
