//! Trace log implementations
//!
//! The file-backed log writes one JSON object per line and never rewrites
//! existing lines. Scans tolerate malformed lines so one bad write cannot
//! poison the analysis window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::TraceLog;
use crate::error::StoreResult;
use crate::types::ExecutionRecord;

fn in_range(record: &ExecutionRecord, agent_id: Option<&str>, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    agent_id.map_or(true, |a| record.agent_id == a) && record.timestamp >= from && record.timestamp <= to
}

/// In-memory trace log
#[derive(Default)]
pub struct MemoryTraceLog {
    records: RwLock<Vec<ExecutionRecord>>,
}

impl MemoryTraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl TraceLog for MemoryTraceLog {
    async fn append(&self, record: &ExecutionRecord) -> StoreResult<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn scan(
        &self,
        agent_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ExecutionRecord>> {
        let records = self.records.read().await;
        let mut matched: Vec<ExecutionRecord> = records
            .iter()
            .filter(|r| in_range(r, agent_id, from, to))
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.timestamp);
        Ok(matched)
    }
}

/// JSON Lines trace log on disk
pub struct JsonlTraceLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTraceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TraceLog for JsonlTraceLog {
    async fn append(&self, record: &ExecutionRecord) -> StoreResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn scan(
        &self,
        agent_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ExecutionRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut skipped = 0usize;
        let mut matched = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<ExecutionRecord>(line) {
                Ok(record) if in_range(&record, agent_id, from, to) => matched.push(record),
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(skipped, path = ?self.path, "Skipped malformed trace lines");
        }
        matched.sort_by_key(|r| r.timestamp);
        Ok(matched)
    }
}
