//! Notification side channel

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::Notifier;

/// Emits alerts into the tracing log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, agent_id: &str, message: &str) -> anyhow::Result<()> {
        warn!(agent_id, "ALERT: {}", message);
        Ok(())
    }
}

/// Keeps alerts in memory, for embedding and tests
#[derive(Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(agent_id, message)` pairs received so far
    pub async fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, agent_id: &str, message: &str) -> anyhow::Result<()> {
        self.messages
            .lock()
            .await
            .push((agent_id.to_string(), message.to_string()));
        Ok(())
    }
}
