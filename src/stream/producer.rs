use crate::log::{LogError, PartitionedLog, PublishAck};
use crate::record::{Record, RecordError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("failed to encode record: {0}")]
    Encode(#[from] RecordError),

    #[error("publish failed: {0}")]
    Log(#[from] LogError),
}

impl ProduceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProduceError::Log(e) if e.is_transient())
    }
}

/// Write side of the log for one stream.
///
/// Publishing is at-least-once: a failure is returned to the caller, who may
/// publish the same record again. The record id is the partition key, so a
/// retried record lands in the same partition and carries the same id.
#[derive(Clone)]
pub struct StreamProducer {
    log: Arc<dyn PartitionedLog>,
    stream: String,
}

impl StreamProducer {
    pub fn new(log: Arc<dyn PartitionedLog>, stream: impl Into<String>) -> Self {
        Self {
            log,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub async fn publish(&self, record: &Record) -> Result<PublishAck, ProduceError> {
        let data = record.to_bytes()?;
        let ack = self.log.publish(&self.stream, &data, &record.id).await?;
        tracing::debug!(
            stream = %self.stream,
            record_id = %record.id,
            partition = %ack.partition,
            sequence = ack.sequence,
            "Published record"
        );
        Ok(ack)
    }
}
