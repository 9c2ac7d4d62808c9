//! Error taxonomy for the improvement loop
//!
//! Store errors come from the external collaborators (trace log, fix
//! history, configuration store). Everything below the supervisor boundary
//! is recovered locally; only [`ImproveError::RollbackFailed`] escalates.

use thiserror::Error;

/// Failures reported by a storage backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected for agent '{agent_id}': {reason}")]
    Rejected { agent_id: String, reason: String },
}

/// Failures of the improvement pipeline
#[derive(Debug, Error)]
pub enum ImproveError {
    /// Configuration write failed; cooldown is refunded
    #[error("apply failed for agent '{agent_id}': {source}")]
    ApplyFailed {
        agent_id: String,
        #[source]
        source: StoreError,
    },

    /// Restoring the pre-apply snapshot failed; agent config state is unknown
    #[error("rollback of improvement '{record_id}' failed for agent '{agent_id}': {source}")]
    RollbackFailed {
        record_id: String,
        agent_id: String,
        #[source]
        source: StoreError,
    },

    #[error("improvement record '{0}' not found")]
    UnknownRecord(String),

    #[error("improvement record '{id}' is {status} and cannot be replayed")]
    NotReplayable { id: String, status: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_error_message_names_agent() {
        let err = ImproveError::RollbackFailed {
            record_id: "fix-1".to_string(),
            agent_id: "coder-001".to_string(),
            source: StoreError::Unavailable("down".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("coder-001"));
        assert!(msg.contains("fix-1"));
    }
}
