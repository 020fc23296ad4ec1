use super::engine::EngineSnapshot;
use crate::log::PositionToken;
use crate::storage::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Checkpoint for job '{job_id}' is corrupt: {reason}")]
    Corruption { job_id: String, reason: String },
}

/// Durable key/value store for serialized checkpoints.
///
/// A save replaces the previous value for the job in one step, so readers
/// see either the old or the new checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(&self, job_id: &str) -> Result<Option<String>, StorageError>;
    async fn save_checkpoint(&self, job_id: &str, data: &str) -> Result<(), StorageError>;
    async fn delete_checkpoint(&self, job_id: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationCheckpoint {
    pub version: u32,
    pub job_id: String,
    pub saved_at: DateTime<Utc>,
    pub stream: String,
    pub partition: String,
    /// Next unread position; every record before it is reflected in `engine`.
    pub position: PositionToken,
    pub engine: EngineSnapshot,
}

pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    job_id: String,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Load the stored checkpoint for `stream`.
    ///
    /// Anything that cannot be decoded, carries another version or belongs to
    /// a different stream is reported as corruption rather than ignored.
    pub async fn load(&self, stream: &str) -> Result<Option<AggregationCheckpoint>, CheckpointError> {
        tracing::info!(job_id = %self.job_id, "Loading checkpoint from storage");

        let Some(raw) = self.store.load_checkpoint(&self.job_id).await? else {
            tracing::info!(job_id = %self.job_id, "No checkpoint found in storage");
            return Ok(None);
        };

        let checkpoint: AggregationCheckpoint =
            serde_json::from_str(&raw).map_err(|e| self.corruption(e.to_string()))?;

        if checkpoint.version != CURRENT_VERSION {
            return Err(self.corruption(format!(
                "unsupported version {} (expected {})",
                checkpoint.version, CURRENT_VERSION
            )));
        }
        if checkpoint.job_id != self.job_id {
            return Err(self.corruption(format!(
                "stored under job '{}'",
                checkpoint.job_id
            )));
        }
        if checkpoint.stream != stream {
            return Err(self.corruption(format!(
                "written for stream '{}', configured stream is '{}'",
                checkpoint.stream, stream
            )));
        }

        tracing::info!(
            job_id = %self.job_id,
            saved_at = %checkpoint.saved_at,
            partition = %checkpoint.partition,
            open_windows = checkpoint.engine.open_windows.len(),
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    pub async fn save(&self, checkpoint: &AggregationCheckpoint) -> Result<(), CheckpointError> {
        let data = serde_json::to_string(checkpoint)?;
        self.store.save_checkpoint(&self.job_id, &data).await?;
        tracing::debug!(job_id = %self.job_id, "Checkpoint saved to storage");
        Ok(())
    }

    /// Discard the stored checkpoint so the job starts from its start policy.
    pub async fn reset(&self) -> Result<(), CheckpointError> {
        self.store.delete_checkpoint(&self.job_id).await?;
        tracing::warn!(job_id = %self.job_id, "Checkpoint reset");
        Ok(())
    }

    fn corruption(&self, reason: String) -> CheckpointError {
        CheckpointError::Corruption {
            job_id: self.job_id.clone(),
            reason,
        }
    }
}
