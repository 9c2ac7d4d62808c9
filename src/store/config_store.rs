//! Agent configuration stores

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::ConfigStore;
use crate::error::StoreResult;
use crate::types::AgentConfig;

/// In-memory configuration store
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: RwLock<HashMap<String, AgentConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an agent's configuration
    pub async fn insert(&self, agent_id: &str, config: AgentConfig) {
        self.configs.write().await.insert(agent_id.to_string(), config);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, agent_id: &str) -> StoreResult<AgentConfig> {
        Ok(self.configs.read().await.get(agent_id).cloned().unwrap_or_default())
    }

    async fn set(&self, agent_id: &str, config: AgentConfig) -> StoreResult<()> {
        self.configs.write().await.insert(agent_id.to_string(), config);
        Ok(())
    }
}

/// Configuration store backed by a single JSON file (agent_id -> object)
pub struct FileConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load_all(&self) -> StoreResult<HashMap<String, AgentConfig>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(&self, agent_id: &str) -> StoreResult<AgentConfig> {
        let _guard = self.lock.lock().await;
        Ok(self.load_all().await?.remove(agent_id).unwrap_or_default())
    }

    async fn set(&self, agent_id: &str, config: AgentConfig) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.load_all().await?;
        all.insert(agent_id.to_string(), config);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a torn file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&all)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(agent_id, path = ?self.path, "Wrote agent configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> AgentConfig {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_defaults_empty() {
        let store = MemoryConfigStore::new();
        assert!(store.get("nobody").await.unwrap().is_empty());
        store.set("a", config(json!({"timeout_ms": 100}))).await.unwrap();
        assert_eq!(store.get("a").await.unwrap()["timeout_ms"], 100);
    }

    #[tokio::test]
    async fn test_file_store_keeps_other_agents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("agent_configs.json"));
        store.set("a", config(json!({"x": 1}))).await.unwrap();
        store.set("b", config(json!({"y": 2}))).await.unwrap();

        let reopened = FileConfigStore::new(dir.path().join("agent_configs.json"));
        assert_eq!(reopened.get("a").await.unwrap()["x"], 1);
        assert_eq!(reopened.get("b").await.unwrap()["y"], 2);
    }
}
