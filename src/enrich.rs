use crate::log::StartPolicy;
use crate::record::Record;
use crate::scoring::ScoringStep;
use crate::stage::StageError;
use crate::stream::retry::retry_transient;
use crate::stream::{ProduceError, RetryPolicy, StreamConsumer, StreamProducer};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;

/// Scores raw records and republishes them to the output stream.
///
/// Positions are not persisted: a restart reopens the input at the
/// configured start policy.
pub struct EnrichmentStage {
    producer: StreamProducer,
    scoring: ScoringStep,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl EnrichmentStage {
    pub fn new(
        producer: StreamProducer,
        scoring: ScoringStep,
        retry: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            producer,
            scoring,
            retry,
            shutdown,
        }
    }

    /// Score one record (unless it already carries a score) and publish it,
    /// retrying transient publish failures.
    pub async fn process(&self, record: Record) -> Result<Record, StageError> {
        let enriched = if record.is_enriched() {
            record
        } else {
            let score = self.scoring.score(&record.id, &record.text).await;
            record.enrich(score, Utc::now())
        };

        let mut shutdown = self.shutdown.clone();
        let producer = &self.producer;
        let ack = retry_transient(
            &self.retry,
            &mut shutdown,
            "publish",
            ProduceError::is_transient,
            || producer.publish(&enriched),
        )
        .await
        .map_err(|e| StageError::from_retry("publish", e))?;

        tracing::info!(
            record_id = %enriched.id,
            score = ?enriched.score,
            partition = %ack.partition,
            "Processed record"
        );
        Ok(enriched)
    }

    /// Consume `partition` of the consumer's stream until shutdown or an
    /// unrecoverable fault. Returns the number of records published.
    pub async fn run(
        &self,
        consumer: StreamConsumer,
        partition: Option<&str>,
        start: StartPolicy,
    ) -> Result<u64, StageError> {
        let handle = consumer.open(partition, start).await?;
        tracing::info!(
            input = %handle.stream,
            partition = %handle.partition,
            output = %self.producer.stream(),
            "Enrichment stage started"
        );

        let mut records = Box::pin(consumer.into_stream(handle));
        let mut processed = 0u64;
        while let Some(item) = records.next().await {
            let record = item?;
            match self.process(record).await {
                Ok(_) => processed += 1,
                Err(e) if e.is_cancelled() => break,
                Err(e) => return Err(e),
            }
        }

        tracing::info!(processed, "Enrichment stage stopped");
        Ok(processed)
    }
}
