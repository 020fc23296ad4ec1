use super::checkpoint::{AggregationCheckpoint, CheckpointError, CheckpointManager, CURRENT_VERSION};
use super::engine::{EngineStats, IngestOutcome, WindowedAggregator};
use super::window::WindowAssigner;
use crate::config::types::AggregationConfig;
use crate::record::WindowAggregate;
use crate::sink::{Sink, SinkError};
use crate::stage::StageError;
use crate::storage::StorageError;
use crate::stream::retry::retry_transient;
use crate::stream::{PartitionHandle, RetryPolicy, StreamConsumer};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

fn checkpoint_is_transient(e: &CheckpointError) -> bool {
    matches!(e, CheckpointError::Storage(StorageError::Database(_)))
}

/// Micro-batch aggregation over one partition.
///
/// Records are ingested as they are polled. At every batch boundary the
/// windows the watermark has passed are written to the sink, and only once
/// that write is confirmed is the checkpoint (position plus engine state)
/// replaced. A crash in between replays from the previous checkpoint and
/// re-emits the same windows.
pub struct AggregationJob {
    consumer: StreamConsumer,
    checkpoints: CheckpointManager,
    sink: Arc<dyn Sink>,
    engine: WindowedAggregator,
    handle: PartitionHandle,
    partition_column: String,
    batch_interval: Duration,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl AggregationJob {
    /// Resume from the stored checkpoint, or open the partition at the
    /// configured start policy when there is none.
    pub async fn start(
        config: &AggregationConfig,
        consumer: StreamConsumer,
        checkpoints: CheckpointManager,
        sink: Arc<dyn Sink>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, StageError> {
        let assigner = WindowAssigner::new(config.window, config.slide)?;
        let lateness = chrono::Duration::from_std(config.allowed_lateness.clamped())
            .unwrap_or_else(|_| chrono::Duration::zero());

        let (handle, engine) = match checkpoints.load(&config.stream).await? {
            Some(checkpoint) => {
                if let Some(partition) = &config.partition {
                    if partition != &checkpoint.partition {
                        return Err(CheckpointError::Corruption {
                            job_id: checkpoints.job_id().to_string(),
                            reason: format!(
                                "written for partition '{}', configured partition is '{}'",
                                checkpoint.partition, partition
                            ),
                        }
                        .into());
                    }
                }
                let handle = consumer.resume(checkpoint.partition, checkpoint.position);
                let engine = WindowedAggregator::restore(assigner, lateness, checkpoint.engine);
                (handle, engine)
            }
            None => {
                let handle = consumer.open(config.partition.as_deref(), config.start).await?;
                (handle, WindowedAggregator::new(assigner, lateness))
            }
        };

        tracing::info!(
            job_id = %checkpoints.job_id(),
            stream = %handle.stream,
            partition = %handle.partition,
            position = %handle.position,
            open_windows = engine.open_windows(),
            "Aggregation job started"
        );

        let retry = consumer.settings().retry.clone();
        Ok(Self {
            consumer,
            checkpoints,
            sink,
            engine,
            handle,
            partition_column: config.sink.partition_column.clone(),
            batch_interval: config.batch_interval,
            retry,
            shutdown,
        })
    }

    pub fn engine(&self) -> &WindowedAggregator {
        &self.engine
    }

    pub fn position(&self) -> &PartitionHandle {
        &self.handle
    }

    /// Poll once and ingest what arrived. Returns the number of records read.
    pub async fn step(&mut self) -> Result<usize, StageError> {
        let limit = self.consumer.settings().max_records;
        let (records, next) = self.consumer.poll(&self.handle, limit).await?;
        self.handle = next;

        for record in &records {
            match self.engine.ingest(record) {
                Ok(IngestOutcome::Accepted { .. }) | Ok(IngestOutcome::LateDropped) => {}
                Err(e) => tracing::warn!(
                    record_id = %record.id,
                    error = %e,
                    "Skipping record that cannot be aggregated"
                ),
            }
        }
        Ok(records.len())
    }

    /// Append every window the watermark has passed to the sink, retrying
    /// transient write failures. Windows leave the engine only once the write
    /// is confirmed, so a failed emission leaves them in place for the next
    /// attempt.
    pub async fn emit_ready(&mut self) -> Result<Vec<WindowAggregate>, StageError> {
        let ready = self.engine.ready_windows();
        let aggregates: Vec<WindowAggregate> =
            ready.iter().filter_map(|w| w.to_aggregate()).collect();

        if !aggregates.is_empty() {
            let mut shutdown = self.shutdown.clone();
            let sink = &self.sink;
            let column = self.partition_column.as_str();
            retry_transient(
                &self.retry,
                &mut shutdown,
                "sink_append",
                SinkError::is_transient,
                || sink.append_batch(&aggregates, column),
            )
            .await
            .map_err(|e| StageError::from_retry("sink append", e))?;
        }

        self.engine.evict(&ready);
        Ok(aggregates)
    }

    /// Persist the current position and engine state.
    pub async fn save_checkpoint(&self) -> Result<(), StageError> {
        let checkpoint = AggregationCheckpoint {
            version: CURRENT_VERSION,
            job_id: self.checkpoints.job_id().to_string(),
            saved_at: Utc::now(),
            stream: self.handle.stream.clone(),
            partition: self.handle.partition.clone(),
            position: self.handle.position.clone(),
            engine: self.engine.snapshot(),
        };

        let mut shutdown = self.shutdown.clone();
        let checkpoints = &self.checkpoints;
        retry_transient(
            &self.retry,
            &mut shutdown,
            "checkpoint_save",
            checkpoint_is_transient,
            || checkpoints.save(&checkpoint),
        )
        .await
        .map_err(|e| StageError::from_retry("checkpoint save", e))
    }

    /// Emit ready windows, then checkpoint. The checkpoint never moves unless
    /// the emission succeeded.
    pub async fn commit_batch(&mut self) -> Result<usize, StageError> {
        let emitted = self.emit_ready().await?;
        self.save_checkpoint().await?;

        let stats = self.engine.stats();
        tracing::info!(
            job_id = %self.checkpoints.job_id(),
            emitted = emitted.len(),
            ingested = stats.ingested,
            late_dropped = stats.late_dropped,
            windows_emitted = stats.windows_emitted,
            open_windows = self.engine.open_windows(),
            watermark = ?self.engine.watermark(),
            "Committed batch"
        );
        Ok(emitted.len())
    }

    /// Run until shutdown, committing at every batch interval and once more
    /// on the way out.
    pub async fn run(mut self) -> Result<EngineStats, StageError> {
        let mut next_commit = Instant::now() + self.batch_interval;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.step().await {
                Ok(0) => self.consumer.idle().await,
                Ok(_) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => return Err(e),
            }

            if Instant::now() >= next_commit {
                match self.commit_batch().await {
                    Ok(_) => {}
                    Err(e) if e.is_cancelled() => {
                        tracing::warn!("Shutdown interrupted batch commit, checkpoint not advanced");
                        return Ok(self.engine.stats());
                    }
                    Err(e) => return Err(e),
                }
                next_commit = Instant::now() + self.batch_interval;
            }
        }

        match self.commit_batch().await {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => {
                tracing::warn!("Final commit failed during shutdown, checkpoint not advanced");
            }
            Err(e) => return Err(e),
        }

        tracing::info!(job_id = %self.checkpoints.job_id(), "Aggregation stage stopped");
        Ok(self.engine.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{SignedDuration, SinkConfig};
    use crate::log::{PartitionedLog, StartPolicy};
    use crate::record::Record;
    use crate::sink::FileSink;
    use crate::storage::DuckDbStorage;
    use crate::stream::ConsumerSettings;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_040 + secs, 0).unwrap()
    }

    fn job_config(sink_root: &std::path::Path) -> AggregationConfig {
        AggregationConfig {
            job_id: "test-job".to_string(),
            stream: "scores".to_string(),
            partition: None,
            start: StartPolicy::Earliest,
            window: Duration::from_secs(60),
            slide: None,
            allowed_lateness: SignedDuration::from_secs(30),
            batch_interval: Duration::from_millis(20),
            sink: SinkConfig {
                path: sink_root.to_path_buf(),
                partition_column: "date".to_string(),
            },
        }
    }

    async fn setup() -> Arc<DuckDbStorage> {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();
        storage.create_stream("scores", 1).await.unwrap();
        Arc::new(storage)
    }

    async fn publish_scored(log: &DuckDbStorage, events: &[(i64, f64)]) {
        for (offset, score) in events {
            let record = Record::new("text", at(*offset)).enrich(*score, at(*offset));
            log.publish("scores", &record.to_bytes().unwrap(), &record.id)
                .await
                .unwrap();
        }
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            idle_interval: Duration::from_millis(5),
            ..ConsumerSettings::default()
        }
    }

    async fn start_job(
        storage: &Arc<DuckDbStorage>,
        config: &AggregationConfig,
        shutdown: watch::Receiver<bool>,
    ) -> AggregationJob {
        let consumer = StreamConsumer::new(storage.clone(), "scores", settings(), shutdown.clone());
        let checkpoints = CheckpointManager::new(storage.clone(), config.job_id.clone());
        let sink = Arc::new(FileSink::new(config.sink.path.clone()));
        AggregationJob::start(config, consumer, checkpoints, sink, shutdown)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_emits_and_checkpoints() {
        let storage = setup().await;
        let out = TempDir::new().unwrap();
        let config = job_config(out.path());
        let (_tx, rx) = watch::channel(false);

        publish_scored(&storage, &[(5, 2.0), (20, 4.0), (40, -1.0), (95, 0.0)]).await;

        let mut job = start_job(&storage, &config, rx.clone()).await;
        assert_eq!(job.step().await.unwrap(), 4);
        assert_eq!(job.commit_batch().await.unwrap(), 1);

        let written = FileSink::new(out.path()).read_all().await.unwrap();
        assert_eq!(written.len(), 1);
        assert!((written[0].avg_score - 1.667).abs() < 1e-3);

        // A restarted job resumes after the last record with the open window intact.
        let resumed = start_job(&storage, &config, rx).await;
        assert_eq!(resumed.position(), job.position());
        assert_eq!(resumed.engine().open_windows(), 1);
        assert_eq!(resumed.engine().watermark(), Some(at(65)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_with_final_commit() {
        let storage = setup().await;
        let out = TempDir::new().unwrap();
        let config = job_config(out.path());
        let (tx, rx) = watch::channel(false);

        publish_scored(&storage, &[(10, 3.0), (200, 1.0)]).await;

        let job = start_job(&storage, &config, rx.clone()).await;
        let handle = tokio::spawn(job.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.ingested, 2);
        assert_eq!(stats.windows_emitted, 1);

        let checkpoint = CheckpointManager::new(storage.clone(), "test-job")
            .load("scores")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.engine.open_windows.len(), 1);
        assert_eq!(checkpoint.engine.stats, stats);
    }

    /// Rejects its first `failures` batches, then delegates to a file sink.
    struct RejectingSink {
        inner: FileSink,
        failures: AtomicU32,
    }

    #[async_trait]
    impl Sink for RejectingSink {
        async fn append_batch(
            &self,
            batch: &[WindowAggregate],
            partition_column: &str,
        ) -> Result<(), SinkError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SinkError::UnknownPartitionColumn(partition_column.to_string()));
            }
            self.inner.append_batch(batch, partition_column).await
        }
    }

    #[tokio::test]
    async fn test_failed_sink_write_keeps_windows_and_checkpoint() {
        let storage = setup().await;
        let out = TempDir::new().unwrap();
        let config = job_config(out.path());
        let (_tx, rx) = watch::channel(false);

        let consumer = StreamConsumer::new(storage.clone(), "scores", settings(), rx.clone());
        let checkpoints = CheckpointManager::new(storage.clone(), config.job_id.clone());
        let sink = Arc::new(RejectingSink {
            inner: FileSink::new(out.path()),
            failures: AtomicU32::new(1),
        });
        let mut job = AggregationJob::start(&config, consumer, checkpoints, sink, rx)
            .await
            .unwrap();
        job.save_checkpoint().await.unwrap();

        let manager = CheckpointManager::new(storage.clone(), "test-job");
        let before = manager.load("scores").await.unwrap().unwrap();

        publish_scored(&storage, &[(5, 2.0), (20, 4.0), (40, -1.0), (95, 0.0)]).await;
        assert_eq!(job.step().await.unwrap(), 4);

        assert!(job.commit_batch().await.is_err());
        let after_failure = manager.load("scores").await.unwrap().unwrap();
        assert_eq!(after_failure.position, before.position);
        assert_eq!(after_failure.engine, before.engine);
        assert_eq!(job.engine().open_windows(), 2);
        assert_eq!(job.engine().stats().windows_emitted, 0);
        assert!(FileSink::new(out.path()).read_all().await.unwrap().is_empty());

        // The same windows go out on the next commit.
        assert_eq!(job.commit_batch().await.unwrap(), 1);
        assert_eq!(job.engine().open_windows(), 1);
        let written = FileSink::new(out.path()).read_all().await.unwrap();
        assert_eq!(written.len(), 1);
        assert!((written[0].avg_score - 1.667).abs() < 1e-3);

        let committed = manager.load("scores").await.unwrap().unwrap();
        assert_eq!(committed.position, job.position().position);
        assert_eq!(committed.engine.stats.windows_emitted, 1);
    }

    #[tokio::test]
    async fn test_mismatched_partition_is_corruption() {
        let storage = setup().await;
        let out = TempDir::new().unwrap();
        let mut config = job_config(out.path());
        let (_tx, rx) = watch::channel(false);

        let job = start_job(&storage, &config, rx.clone()).await;
        job.save_checkpoint().await.unwrap();

        config.partition = Some("partition-0001".to_string());
        let consumer = StreamConsumer::new(storage.clone(), "scores", settings(), rx.clone());
        let checkpoints = CheckpointManager::new(storage.clone(), config.job_id.clone());
        let result = AggregationJob::start(
            &config,
            consumer,
            checkpoints,
            Arc::new(FileSink::new(out.path())),
            rx,
        )
        .await;
        assert!(matches!(
            result,
            Err(StageError::Checkpoint(CheckpointError::Corruption { .. }))
        ));
    }
}
