//! Outcome recording
//!
//! Normalizes finished task executions into [`ExecutionRecord`]s and appends
//! them to the trace log. A failed append never reaches the caller: the
//! record stays in a bounded retry queue, is flushed ahead of the next
//! append, and the recorder reports itself degraded until the queue drains.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::ImproveError;
use crate::store::TraceLog;
use crate::types::{ExecutionOutcome, ExecutionRecord};

/// Records held for retry while the trace log is failing
pub const DEFAULT_MAX_PENDING: usize = 1024;

const EVENT_CAPACITY: usize = 256;

/// Append-only outcome recorder
pub struct OutcomeRecorder {
    log: Arc<dyn TraceLog>,
    pending: Mutex<VecDeque<ExecutionRecord>>,
    max_pending: usize,
    degraded: AtomicBool,
    events: broadcast::Sender<ExecutionRecord>,
}

impl OutcomeRecorder {
    pub fn new(log: Arc<dyn TraceLog>) -> Self {
        Self::with_capacity(log, DEFAULT_MAX_PENDING)
    }

    pub fn with_capacity(log: Arc<dyn TraceLog>, max_pending: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            log,
            pending: Mutex::new(VecDeque::new()),
            max_pending: max_pending.max(1),
            degraded: AtomicBool::new(false),
            events,
        }
    }

    /// Record an execution that just finished
    pub async fn record(
        &self,
        agent_id: &str,
        task: &str,
        outcome: ExecutionOutcome,
    ) -> Result<String, ImproveError> {
        self.record_at(agent_id, task, outcome, Utc::now()).await
    }

    /// Record an execution with an explicit completion time.
    ///
    /// Only an empty `agent_id` is an error. Storage faults are absorbed and
    /// the returned id stays valid: the record is delivered once the log
    /// recovers.
    pub async fn record_at(
        &self,
        agent_id: &str,
        task: &str,
        outcome: ExecutionOutcome,
        timestamp: DateTime<Utc>,
    ) -> Result<String, ImproveError> {
        if agent_id.trim().is_empty() {
            return Err(ImproveError::InvalidInput("agent_id must not be empty".to_string()));
        }

        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            agent_id: agent_id.to_string(),
            task_description: task.to_string(),
            success: outcome.success,
            duration_ms: outcome.duration.as_millis() as u64,
            context: outcome.context,
            error_kind: if outcome.success { None } else { outcome.error_kind },
        };
        let id = record.id.clone();

        let mut pending = self.pending.lock().await;
        pending.push_back(record);
        self.flush(&mut pending).await;
        Ok(id)
    }

    /// Append queued records oldest first, stopping at the first failure
    async fn flush(&self, pending: &mut VecDeque<ExecutionRecord>) {
        while let Some(record) = pending.front() {
            match self.log.append(record).await {
                Ok(()) => {
                    debug!(agent_id = %record.agent_id, record_id = %record.id, success = record.success, "Recorded execution");
                    if let Some(record) = pending.pop_front() {
                        // No subscribers is fine
                        let _ = self.events.send(record);
                    }
                }
                Err(e) => {
                    if !self.degraded.swap(true, Ordering::SeqCst) {
                        warn!("Trace log append failed, recorder degraded: {}", e);
                    }
                    while pending.len() > self.max_pending {
                        if let Some(dropped) = pending.pop_front() {
                            warn!(agent_id = %dropped.agent_id, record_id = %dropped.id, "Retry queue full, dropping record");
                        }
                    }
                    return;
                }
            }
        }
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Trace log recovered, retry queue drained");
        }
    }

    /// Retry queued records without recording a new one
    pub async fn retry_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        self.flush(&mut pending).await;
        pending.len()
    }

    /// True while at least one record is waiting for the trace log
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Stream of records as they become durable
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionRecord> {
        self.events.subscribe()
    }

    /// Sender side of the record stream, for watchers created later
    pub fn events(&self) -> broadcast::Sender<ExecutionRecord> {
        self.events.clone()
    }

    pub fn log(&self) -> Arc<dyn TraceLog> {
        self.log.clone()
    }
}
