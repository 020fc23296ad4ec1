//! Append-only output for finalized window aggregates.

pub mod file;

pub use file::FileSink;

use crate::record::WindowAggregate;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode aggregate: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unknown partition column: {0}")]
    UnknownPartitionColumn(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Io(_))
    }
}

/// Duplicate appends of the same window are allowed; readers of the sink
/// deduplicate by window key.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Durably append `batch`, grouped into partitions by `partition_column`.
    /// Returns only once the write is confirmed.
    async fn append_batch(
        &self,
        batch: &[WindowAggregate],
        partition_column: &str,
    ) -> Result<(), SinkError>;
}
