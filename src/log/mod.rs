//! Contract of the append-only, partitioned, replayable log the stages talk
//! through. The broker itself is a collaborator; `storage::duckdb` provides a
//! local implementation of this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("partition {partition} unavailable in stream {stream}")]
    PartitionUnavailable { stream: String, partition: String },

    #[error("invalid position token: {0}")]
    InvalidPosition(String),

    #[error("transient log error: {0}")]
    Transient(String),
}

impl LogError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::Transient(_))
    }
}

/// Where a fresh position starts within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    /// Oldest retained record (trim horizon).
    Earliest,
    /// Only records appended after the position is obtained.
    Latest,
}

/// Opaque cursor naming the next record to read within one partition.
///
/// Only the log implementation that issued a token can interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionToken(String);

impl PositionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stored entry as returned by a poll.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub partition: String,
    pub sequence: u64,
    pub partition_key: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PollResponse {
    pub entries: Vec<LogEntry>,
    pub next: PositionToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub partition: String,
    pub sequence: u64,
}

#[async_trait]
pub trait PartitionedLog: Send + Sync {
    async fn describe_partitions(&self, stream: &str) -> Result<Vec<String>, LogError>;

    async fn get_position(
        &self,
        stream: &str,
        partition: &str,
        start: StartPolicy,
    ) -> Result<PositionToken, LogError>;

    /// Read up to `limit` entries at `position`. An empty response is the
    /// normal steady state, not an error.
    async fn poll(&self, position: &PositionToken, limit: usize) -> Result<PollResponse, LogError>;

    async fn publish(
        &self,
        stream: &str,
        data: &[u8],
        partition_key: &str,
    ) -> Result<PublishAck, LogError>;
}
