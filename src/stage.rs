use crate::aggregate::checkpoint::CheckpointError;
use crate::aggregate::engine::EngineError;
use crate::aggregate::window::WindowError;
use crate::scoring::ScoringError;
use crate::sink::SinkError;
use crate::storage::StorageError;
use crate::stream::{ConsumerError, ProduceError, RetryError};
use std::fmt::Display;
use thiserror::Error;
use tokio::sync::watch;

/// Unrecoverable failure of a pipeline stage. The process exits non-zero.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("producer error: {0}")]
    Produce(#[from] ProduceError),

    #[error("scoring setup failed: {0}")]
    Scoring(#[from] ScoringError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("aggregation error: {0}")]
    Engine(#[from] EngineError),

    #[error("window settings invalid: {0}")]
    Window(#[from] WindowError),

    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("stage cancelled by shutdown")]
    Cancelled,

    #[error("stage task failed: {0}")]
    Join(String),
}

impl StageError {
    /// Fold the outcome of a retried operation into a stage error.
    pub fn from_retry<E>(operation: &'static str, err: RetryError<E>) -> Self
    where
        E: Into<StageError> + Display,
    {
        match err {
            RetryError::Fatal(e) => e.into(),
            RetryError::Exhausted {
                attempts,
                last_error,
            } => StageError::RetriesExhausted {
                operation,
                attempts,
                message: last_error.to_string(),
            },
            RetryError::Cancelled => StageError::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            StageError::Cancelled | StageError::Consumer(ConsumerError::Cancelled)
        )
    }
}

/// Shutdown signal shared by every stage task.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogError;

    #[test]
    fn test_exhausted_retry_message() {
        let err = StageError::from_retry(
            "sink write",
            RetryError::Exhausted {
                attempts: 4,
                last_error: SinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )),
            },
        );
        assert_eq!(
            err.to_string(),
            "sink write failed after 4 attempts: sink I/O error: disk full"
        );
    }

    #[test]
    fn test_cancellation_detected() {
        assert!(StageError::from_retry::<SinkError>("x", RetryError::Cancelled).is_cancelled());
        assert!(StageError::Consumer(ConsumerError::Cancelled).is_cancelled());
        assert!(!StageError::Consumer(ConsumerError::Log(LogError::Transient(
            "x".to_string()
        )))
        .is_cancelled());
    }
}
