//! Recent-window index over a trace log
//!
//! The trigger check runs on every failed execution, so it must not read the
//! whole log. [`WindowedTraceLog`] keeps each agent's records from the last
//! `retention` in a bounded in-memory deque and answers per-agent scans that
//! fall inside it. Anything older, and every cross-agent scan, goes to the
//! wrapped log.
//!
//! An agent's deque is filled from the wrapped log on its first scan, then
//! kept current by appends made through this wrapper.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::TraceLog;
use crate::error::StoreResult;
use crate::types::ExecutionRecord;

/// Records kept per agent before the oldest are evicted
pub const DEFAULT_WINDOW_CAPACITY: usize = 10_000;

#[derive(Default)]
struct AgentWindow {
    /// Holds every record of the agent with `timestamp >= covered_from`,
    /// oldest first. `None` until filled from the wrapped log.
    covered_from: Option<DateTime<Utc>>,
    records: VecDeque<ExecutionRecord>,
}

impl AgentWindow {
    fn insert(&mut self, record: &ExecutionRecord) {
        let at = self
            .records
            .partition_point(|r| r.timestamp <= record.timestamp);
        let duplicate = self
            .records
            .range(..at)
            .rev()
            .take_while(|r| r.timestamp == record.timestamp)
            .any(|r| r.id == record.id);
        if !duplicate {
            self.records.insert(at, record.clone());
        }
    }

    fn prune(&mut self, cutoff: DateTime<Utc>, capacity: usize) {
        while self.records.front().map_or(false, |r| r.timestamp < cutoff) {
            self.records.pop_front();
        }
        let mut covered = self.covered_from.map_or(cutoff, |from| from.max(cutoff));
        while self.records.len() > capacity {
            if let Some(evicted) = self.records.pop_front() {
                covered = covered.max(evicted.timestamp + Duration::nanoseconds(1));
            }
        }
        if self.covered_from.is_some() {
            self.covered_from = Some(covered);
        }
    }

    fn covers(&self, from: DateTime<Utc>) -> bool {
        self.covered_from.map_or(false, |covered| from >= covered)
    }
}

/// Trace log decorator serving recent per-agent scans from memory
pub struct WindowedTraceLog {
    inner: Arc<dyn TraceLog>,
    retention: Duration,
    capacity: usize,
    agents: RwLock<HashMap<String, Arc<Mutex<AgentWindow>>>>,
}

impl WindowedTraceLog {
    pub fn new(inner: Arc<dyn TraceLog>, retention: Duration) -> Self {
        Self::with_capacity(inner, retention, DEFAULT_WINDOW_CAPACITY)
    }

    pub fn with_capacity(inner: Arc<dyn TraceLog>, retention: Duration, capacity: usize) -> Self {
        Self {
            inner,
            retention,
            capacity: capacity.max(1),
            agents: RwLock::new(HashMap::new()),
        }
    }

    async fn window(&self, agent_id: &str) -> Arc<Mutex<AgentWindow>> {
        if let Some(window) = self.agents.read().await.get(agent_id) {
            return window.clone();
        }
        self.agents
            .write()
            .await
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    /// Records currently held for `agent_id`
    pub async fn cached(&self, agent_id: &str) -> usize {
        match self.agents.read().await.get(agent_id) {
            Some(window) => window.lock().await.records.len(),
            None => 0,
        }
    }
}

#[async_trait]
impl TraceLog for WindowedTraceLog {
    async fn append(&self, record: &ExecutionRecord) -> StoreResult<()> {
        self.inner.append(record).await?;

        let window = self.window(&record.agent_id).await;
        let mut window = window.lock().await;
        let too_old = window
            .covered_from
            .map_or(false, |covered| record.timestamp < covered);
        if !too_old {
            window.insert(record);
            if window.records.len() > self.capacity {
                let cutoff = window.covered_from.unwrap_or(DateTime::<Utc>::MIN_UTC);
                window.prune(cutoff, self.capacity);
            }
        }
        Ok(())
    }

    async fn scan(
        &self,
        agent_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ExecutionRecord>> {
        let Some(agent_id) = agent_id else {
            return self.inner.scan(None, from, to).await;
        };

        // Scans reaching past `now` (treatment rescans) must not prune live records
        let horizon = to
            .min(Utc::now())
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let window = self.window(agent_id).await;
        let mut window = window.lock().await;

        if window.covered_from.is_none() {
            if from < horizon {
                drop(window);
                return self.inner.scan(Some(agent_id), from, to).await;
            }
            let loaded = self.inner.scan(Some(agent_id), horizon, DateTime::<Utc>::MAX_UTC).await?;
            debug!(agent_id, loaded = loaded.len(), "Filled recent window from trace log");
            for record in &loaded {
                window.insert(record);
            }
            window.covered_from = Some(horizon);
        }
        window.prune(horizon, self.capacity);

        if !window.covers(from) {
            drop(window);
            return self.inner.scan(Some(agent_id), from, to).await;
        }
        Ok(window
            .records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTraceLog;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(agent: &str, at: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: at,
            agent_id: agent.to_string(),
            task_description: "task".to_string(),
            success: false,
            duration_ms: 5,
            context: serde_json::json!({}),
            error_kind: Some("timeout".to_string()),
        }
    }

    /// Counts scans that reach the wrapped log
    #[derive(Default)]
    struct CountingLog {
        inner: MemoryTraceLog,
        scans: AtomicUsize,
    }

    #[async_trait]
    impl TraceLog for CountingLog {
        async fn append(&self, record: &ExecutionRecord) -> StoreResult<()> {
            self.inner.append(record).await
        }

        async fn scan(
            &self,
            agent_id: Option<&str>,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> StoreResult<Vec<ExecutionRecord>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            self.inner.scan(agent_id, from, to).await
        }
    }

    #[tokio::test]
    async fn test_recent_scans_stay_in_memory() {
        let inner = Arc::new(CountingLog::default());
        let now = Utc::now();
        inner.append(&record("a", now - Duration::hours(2))).await.unwrap();
        inner.append(&record("a", now - Duration::hours(40))).await.unwrap();

        let log = WindowedTraceLog::new(inner.clone(), Duration::hours(24));
        let first = log.scan(Some("a"), now - Duration::hours(24), now).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(inner.scans.load(Ordering::SeqCst), 1);

        for i in 0..5 {
            log.append(&record("a", now + Duration::seconds(i))).await.unwrap();
        }
        let later = now + Duration::seconds(10);
        let second = log.scan(Some("a"), later - Duration::hours(24), later).await.unwrap();
        assert_eq!(second.len(), 6);
        assert_eq!(inner.scans.load(Ordering::SeqCst), 1);
        assert_eq!(log.cached("a").await, 6);
    }

    #[tokio::test]
    async fn test_older_and_global_scans_fall_through() {
        let inner = Arc::new(CountingLog::default());
        let now = Utc::now();
        inner.append(&record("a", now - Duration::hours(40))).await.unwrap();
        let log = WindowedTraceLog::new(inner.clone(), Duration::hours(24));

        log.scan(Some("a"), now - Duration::hours(24), now).await.unwrap();
        let old = log.scan(Some("a"), now - Duration::hours(48), now).await.unwrap();
        assert_eq!(old.len(), 1);
        let all = log.scan(None, now - Duration::hours(48), now).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(inner.scans.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_and_narrows_coverage() {
        let inner = Arc::new(MemoryTraceLog::new());
        let log = WindowedTraceLog::with_capacity(inner.clone(), Duration::hours(24), 3);
        let now = Utc::now();
        log.scan(Some("a"), now - Duration::hours(24), now).await.unwrap();

        for i in 0..5 {
            log.append(&record("a", now - Duration::minutes(10 - i))).await.unwrap();
        }
        assert_eq!(log.cached("a").await, 3);

        // Evicted records still come back through the wrapped log
        let scanned = log.scan(Some("a"), now - Duration::hours(1), now).await.unwrap();
        assert_eq!(scanned.len(), 5);
    }

    #[tokio::test]
    async fn test_append_before_first_scan_is_not_duplicated() {
        let inner = Arc::new(MemoryTraceLog::new());
        let log = WindowedTraceLog::new(inner.clone(), Duration::hours(24));
        let now = Utc::now();
        log.append(&record("a", now)).await.unwrap();
        assert_eq!(log.cached("a").await, 1);

        let scanned = log.scan(Some("a"), now - Duration::hours(1), now).await.unwrap();
        assert_eq!(scanned.len(), 1);
    }
}
