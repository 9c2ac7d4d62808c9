//! External collaborators of the improvement loop
//!
//! Each boundary is a trait so the loop can run against the file-backed
//! stores in production and in-memory ones in tests or when embedded:
//! - [`TraceLog`]: append-only execution outcome log, scanned by time range;
//!   [`WindowedTraceLog`] serves recent per-agent scans from memory
//! - [`FixHistory`]: append-only log of improvement record transitions
//! - [`ConfigStore`]: per-agent key/value configuration
//! - [`Notifier`]: best-effort human-visible alerts

pub mod config_store;
pub mod history;
pub mod notify;
pub mod trace;
pub mod window;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use crate::error::StoreResult;
use crate::types::{AgentConfig, AppliedImprovementRecord, ExecutionRecord};

pub use config_store::{FileConfigStore, MemoryConfigStore};
pub use history::{JsonlFixHistory, MemoryFixHistory};
pub use notify::{LogNotifier, MemoryNotifier};
pub use trace::{JsonlTraceLog, MemoryTraceLog};
pub use window::WindowedTraceLog;

/// Durable, append-only outcome log
#[async_trait]
pub trait TraceLog: Send + Sync {
    /// Append one record. Must be safe under concurrent writers.
    async fn append(&self, record: &ExecutionRecord) -> StoreResult<()>;

    /// Records with `from <= timestamp <= to`, oldest first.
    /// `None` for `agent_id` scans every agent.
    async fn scan(
        &self,
        agent_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ExecutionRecord>>;
}

/// Append-only log of [`AppliedImprovementRecord`] transitions keyed by id
#[async_trait]
pub trait FixHistory: Send + Sync {
    async fn append(&self, record: &AppliedImprovementRecord) -> StoreResult<()>;

    /// Current state of every record (latest transition per id), in apply order
    async fn records(&self) -> StoreResult<Vec<AppliedImprovementRecord>>;

    async fn get(&self, id: &str) -> StoreResult<Option<AppliedImprovementRecord>> {
        Ok(self.records().await?.into_iter().find(|r| r.id == id))
    }
}

/// Per-agent configuration store
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current configuration; empty for an agent never written
    async fn get(&self, agent_id: &str) -> StoreResult<AgentConfig>;

    /// Replace the agent's configuration with `config`
    async fn set(&self, agent_id: &str, config: AgentConfig) -> StoreResult<()>;
}

/// Fire-and-forget alert channel; callers ignore failures
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, agent_id: &str, message: &str) -> anyhow::Result<()>;
}

/// Handles to every collaborator the loop talks to
#[derive(Clone)]
pub struct Stores {
    pub trace: Arc<dyn TraceLog>,
    pub history: Arc<dyn FixHistory>,
    pub configs: Arc<dyn ConfigStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl Stores {
    /// Everything in memory; alerts go to the tracing log
    pub fn in_memory() -> Self {
        Self {
            trace: Arc::new(MemoryTraceLog::new()),
            history: Arc::new(MemoryFixHistory::new()),
            configs: Arc::new(MemoryConfigStore::new()),
            notifier: Arc::new(LogNotifier),
        }
    }

    /// File-backed stores under `dir`
    pub fn file_backed(dir: &Path) -> Self {
        Self {
            trace: Arc::new(JsonlTraceLog::new(dir.join("traces.jsonl"))),
            history: Arc::new(JsonlFixHistory::new(dir.join("fixes.jsonl"))),
            configs: Arc::new(FileConfigStore::new(dir.join("agent_configs.json"))),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// Collapse a transition log to the latest state per id, keeping first-seen order
pub(crate) fn latest_per_id(transitions: Vec<AppliedImprovementRecord>) -> Vec<AppliedImprovementRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: std::collections::HashMap<String, AppliedImprovementRecord> =
        std::collections::HashMap::new();
    for record in transitions {
        if !latest.contains_key(&record.id) {
            order.push(record.id.clone());
        }
        latest.insert(record.id.clone(), record);
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}
