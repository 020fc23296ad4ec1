use crate::config::types::GeneratorConfig;
use crate::record::Record;
use crate::stream::retry::shutdown_requested;
use crate::stream::{ProduceError, StreamProducer};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const DEFAULT_PHRASES: &[&str] = &[
    "Bitcoin just broke another resistance level, feeling bullish today",
    "Not sure about this dip, holding for now",
    "Another day, another crash. Bitcoin is a scam",
    "Stacking sats slowly and steadily",
    "The halving is coming and the rally will be amazing",
    "Fees are terrible again, panic selling everywhere",
    "Bitcoin is interesting!",
    "Watching the charts, nothing much happening",
    "Lost a bit on that trade, worried about the weekend",
    "Love seeing adoption grow, strong fundamentals",
];

/// Publishes synthetic text records at a fixed cadence.
pub struct Generator {
    producer: StreamProducer,
    phrases: Vec<String>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Generator {
    pub fn new(
        config: &GeneratorConfig,
        producer: StreamProducer,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let phrases = if config.phrases.is_empty() {
            DEFAULT_PHRASES.iter().map(|p| p.to_string()).collect()
        } else {
            config.phrases.clone()
        };

        Self {
            producer,
            phrases,
            interval: config.interval,
            shutdown,
        }
    }

    /// A fresh record with a random phrase, stamped now.
    pub fn next_record(&self) -> Record {
        let id = Uuid::new_v4();
        let index = (id.as_u128() % self.phrases.len().max(1) as u128) as usize;
        let text = self.phrases.get(index).cloned().unwrap_or_default();
        Record {
            id: id.to_string(),
            text,
            created_at: Utc::now(),
            score: None,
            enriched_at: None,
        }
    }

    pub async fn publish_one(&self) -> Result<Record, ProduceError> {
        let record = self.next_record();
        self.producer.publish(&record).await?;
        Ok(record)
    }

    /// Publish until shutdown. Failed publishes are logged and skipped.
    /// Returns the number of records published.
    pub async fn run(self) -> u64 {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.interval);
        let mut published = 0u64;

        tracing::info!(
            stream = %self.producer.stream(),
            interval_ms = self.interval.as_millis() as u64,
            "Generator started"
        );

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    match self.publish_one().await {
                        Ok(record) => {
                            published += 1;
                            tracing::info!(record_id = %record.id, text = %record.text, "Sent record");
                        }
                        Err(e) => tracing::error!(error = %e, "Error sending record"),
                    }
                }
            }
        }

        tracing::info!(published, "Generator stopped");
        published
    }
}
