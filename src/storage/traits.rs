use crate::log::LogError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("partition {partition} not found in stream {stream}")]
    PartitionNotFound { stream: String, partition: String },

    #[error("invalid position token: {0}")]
    InvalidPosition(String),
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<StorageError> for LogError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::StreamNotFound(stream) => LogError::StreamNotFound(stream),
            StorageError::PartitionNotFound { stream, partition } => {
                LogError::PartitionUnavailable { stream, partition }
            }
            StorageError::InvalidPosition(token) => LogError::InvalidPosition(token),
            StorageError::Database(msg) => LogError::Transient(msg),
        }
    }
}
