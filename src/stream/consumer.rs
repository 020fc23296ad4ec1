use super::retry::{retry_transient, shutdown_requested, RetryError, RetryPolicy};
use crate::log::{LogError, PartitionedLog, PositionToken, StartPolicy};
use crate::record::Record;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("partition {partition} unavailable in stream {stream}")]
    PartitionUnavailable { stream: String, partition: String },

    #[error("transient failure after {attempts} attempts: {last_error}")]
    TransientFailure { attempts: u32, last_error: LogError },

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("consumer cancelled by shutdown")]
    Cancelled,
}

impl From<RetryError<LogError>> for ConsumerError {
    fn from(e: RetryError<LogError>) -> Self {
        match e {
            RetryError::Fatal(LogError::PartitionUnavailable { stream, partition }) => {
                ConsumerError::PartitionUnavailable { stream, partition }
            }
            RetryError::Fatal(e) => ConsumerError::Log(e),
            RetryError::Exhausted {
                attempts,
                last_error,
            } => ConsumerError::TransientFailure {
                attempts,
                last_error,
            },
            RetryError::Cancelled => ConsumerError::Cancelled,
        }
    }
}

/// Poll and retry tuning shared by every consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Upper bound on records returned by one poll.
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Bound on a single poll call; an expired poll counts as a transient fault.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Pause after an empty poll.
    #[serde(default = "default_idle_interval", with = "humantime_serde")]
    pub idle_interval: Duration,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_records() -> usize {
    100
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_interval() -> Duration {
    Duration::from_millis(500)
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            poll_timeout: default_poll_timeout(),
            idle_interval: default_idle_interval(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Read position within one partition.
///
/// Handles are plain values: a poll takes one by reference and returns its
/// successor, so the caller always holds the last confirmed position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionHandle {
    pub stream: String,
    pub partition: String,
    pub position: PositionToken,
}

/// Single-partition reader over a [`PartitionedLog`].
pub struct StreamConsumer {
    log: Arc<dyn PartitionedLog>,
    stream: String,
    settings: ConsumerSettings,
    shutdown: watch::Receiver<bool>,
}

impl StreamConsumer {
    pub fn new(
        log: Arc<dyn PartitionedLog>,
        stream: impl Into<String>,
        settings: ConsumerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            log,
            stream: stream.into(),
            settings,
            shutdown,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Obtain a fresh handle for `partition`, or for the first partition of
    /// the stream when none is given.
    pub async fn open(
        &self,
        partition: Option<&str>,
        start: StartPolicy,
    ) -> Result<PartitionHandle, ConsumerError> {
        let mut shutdown = self.shutdown.clone();
        let partitions = retry_transient(
            &self.settings.retry,
            &mut shutdown,
            "describe_partitions",
            LogError::is_transient,
            || self.log.describe_partitions(&self.stream),
        )
        .await?;

        if partitions.len() > 1 {
            tracing::warn!(
                stream = %self.stream,
                partitions = partitions.len(),
                "Stream has more than one partition, records routed to other partitions are not read"
            );
        }

        let partition = match partition {
            Some(p) if partitions.iter().any(|known| known == p) => p.to_string(),
            Some(p) => {
                return Err(ConsumerError::PartitionUnavailable {
                    stream: self.stream.clone(),
                    partition: p.to_string(),
                })
            }
            None => partitions
                .into_iter()
                .next()
                .ok_or_else(|| ConsumerError::PartitionUnavailable {
                    stream: self.stream.clone(),
                    partition: "<none>".to_string(),
                })?,
        };

        let position = retry_transient(
            &self.settings.retry,
            &mut shutdown,
            "get_position",
            LogError::is_transient,
            || self.log.get_position(&self.stream, &partition, start),
        )
        .await?;

        tracing::info!(
            stream = %self.stream,
            partition = %partition,
            start = ?start,
            "Opened partition"
        );

        Ok(PartitionHandle {
            stream: self.stream.clone(),
            partition,
            position,
        })
    }

    /// Rebuild a handle from a previously returned position.
    pub fn resume(&self, partition: impl Into<String>, position: PositionToken) -> PartitionHandle {
        PartitionHandle {
            stream: self.stream.clone(),
            partition: partition.into(),
            position,
        }
    }

    /// Read up to `max_records` records at `handle`.
    ///
    /// Returns the records in log order together with the successor handle.
    /// An empty batch is normal. Transient faults and timeouts are retried
    /// with backoff; `handle` stays valid whatever the outcome. Entries that
    /// cannot be decoded are skipped with a warning.
    pub async fn poll(
        &self,
        handle: &PartitionHandle,
        max_records: usize,
    ) -> Result<(Vec<Record>, PartitionHandle), ConsumerError> {
        let mut shutdown = self.shutdown.clone();
        let timeout = self.settings.poll_timeout;
        let log = &self.log;

        let response = retry_transient(
            &self.settings.retry,
            &mut shutdown,
            "poll",
            LogError::is_transient,
            || async move {
                match tokio::time::timeout(timeout, log.poll(&handle.position, max_records)).await {
                    Ok(result) => result,
                    Err(_) => Err(LogError::Transient(format!(
                        "poll timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            },
        )
        .await?;

        let mut records = Vec::with_capacity(response.entries.len());
        for entry in response.entries {
            match Record::from_bytes(&entry.data) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    stream = %handle.stream,
                    partition = %entry.partition,
                    sequence = entry.sequence,
                    error = %e,
                    "Skipping undecodable entry"
                ),
            }
        }

        let next = PartitionHandle {
            stream: handle.stream.clone(),
            partition: handle.partition.clone(),
            position: response.next,
        };
        Ok((records, next))
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for the idle interval, returning early on shutdown.
    pub async fn idle(&self) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.settings.idle_interval) => {}
            _ = shutdown_requested(&mut shutdown) => {}
        }
    }

    /// Records one at a time, polling as needed, until shutdown or an
    /// unrecoverable error (yielded once as the final item).
    pub fn into_stream(
        self,
        handle: PartitionHandle,
    ) -> impl Stream<Item = Result<Record, ConsumerError>> + Send {
        struct State {
            consumer: StreamConsumer,
            handle: PartitionHandle,
            buffered: VecDeque<Record>,
            finished: bool,
        }

        let initial = State {
            consumer: self,
            handle,
            buffered: VecDeque::new(),
            finished: false,
        };

        stream::unfold(initial, |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }
                if let Some(record) = state.buffered.pop_front() {
                    return Some((Ok(record), state));
                }
                if state.consumer.is_shutdown() {
                    return None;
                }

                let limit = state.consumer.settings.max_records;
                match state.consumer.poll(&state.handle, limit).await {
                    Ok((records, next)) => {
                        state.handle = next;
                        if records.is_empty() {
                            state.consumer.idle().await;
                        } else {
                            state.buffered.extend(records);
                        }
                    }
                    Err(ConsumerError::Cancelled) => return None,
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DuckDbStorage;
    use chrono::Utc;
    use futures::StreamExt;

    fn fast_settings() -> ConsumerSettings {
        ConsumerSettings {
            max_records: 10,
            poll_timeout: Duration::from_secs(2),
            idle_interval: Duration::from_millis(10),
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        }
    }

    async fn setup_log() -> Arc<DuckDbStorage> {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();
        storage.create_stream("raw", 1).await.unwrap();
        Arc::new(storage)
    }

    async fn publish_texts(log: &DuckDbStorage, texts: &[&str]) -> Vec<Record> {
        let mut records = Vec::new();
        for text in texts {
            let record = Record::new(*text, Utc::now());
            log.publish("raw", &record.to_bytes().unwrap(), &record.id)
                .await
                .unwrap();
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn test_open_defaults_to_first_partition() {
        let log = setup_log().await;
        let (_tx, rx) = watch::channel(false);
        let consumer = StreamConsumer::new(log, "raw", fast_settings(), rx);

        let handle = consumer.open(None, StartPolicy::Earliest).await.unwrap();
        assert_eq!(handle.partition, "partition-0000");
        assert_eq!(handle.stream, "raw");
    }

    #[tokio::test]
    async fn test_open_unknown_partition() {
        let log = setup_log().await;
        let (_tx, rx) = watch::channel(false);
        let consumer = StreamConsumer::new(log, "raw", fast_settings(), rx);

        let result = consumer
            .open(Some("partition-0042"), StartPolicy::Earliest)
            .await;
        assert!(matches!(
            result,
            Err(ConsumerError::PartitionUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_poll_advances_only_returned_handle() {
        let log = setup_log().await;
        let published = publish_texts(&log, &["a", "b", "c"]).await;
        let (_tx, rx) = watch::channel(false);
        let consumer = StreamConsumer::new(log, "raw", fast_settings(), rx);

        let handle = consumer.open(None, StartPolicy::Earliest).await.unwrap();
        let (first, next) = consumer.poll(&handle, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, published[0].id);

        // Re-polling the old handle redelivers the same records.
        let (again, _) = consumer.poll(&handle, 2).await.unwrap();
        assert_eq!(again[0].id, published[0].id);

        let (rest, last) = consumer.poll(&next, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, published[2].id);

        let (empty, same) = consumer.poll(&last, 10).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(same, last);
    }

    #[tokio::test]
    async fn test_undecodable_entries_are_skipped() {
        let log = setup_log().await;
        log.publish("raw", b"not a record", "junk").await.unwrap();
        let published = publish_texts(&log, &["ok"]).await;
        let (_tx, rx) = watch::channel(false);
        let consumer = StreamConsumer::new(log, "raw", fast_settings(), rx);

        let handle = consumer.open(None, StartPolicy::Earliest).await.unwrap();
        let (records, _) = consumer.poll(&handle, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, published[0].id);
    }

    #[tokio::test]
    async fn test_into_stream_yields_records_in_order() {
        let log = setup_log().await;
        let published = publish_texts(&log, &["one", "two", "three"]).await;
        let (tx, rx) = watch::channel(false);
        let consumer = StreamConsumer::new(log, "raw", fast_settings(), rx);

        let handle = consumer.open(None, StartPolicy::Earliest).await.unwrap();
        let mut records = Box::pin(consumer.into_stream(handle));

        for expected in &published {
            let record = records.next().await.unwrap().unwrap();
            assert_eq!(record.id, expected.id);
        }

        tx.send(true).unwrap();
        let end = tokio::time::timeout(Duration::from_secs(2), records.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
