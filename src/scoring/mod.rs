//! Text scoring: the scoring service seam and the enrichment-side wrapper
//! that turns every failure into a neutral fallback.

pub mod http;
pub mod lexicon;

pub use http::HttpScorer;
pub use lexicon::LexiconScorer;

use crate::config::types::{ScoringBackend, ScoringConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Bounds of a valid score.
pub const MIN_SCORE: f64 = -10.0;
pub const MAX_SCORE: f64 = 10.0;

/// Score substituted when the scoring service fails.
pub const NEUTRAL_SCORE: f64 = 0.0;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("scoring request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("scoring service returned status {status}: {message}")]
    Service { status: u16, message: String },

    #[error("malformed score response: {0}")]
    Malformed(String),

    #[error("scoring timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score `text` within `[MIN_SCORE, MAX_SCORE]`.
    async fn score(&self, text: &str) -> Result<f64, ScoringError>;
}

/// Parse a service answer into a score, rejecting anything outside the
/// valid range.
pub fn parse_score(raw: &str) -> Result<f64, ScoringError> {
    let trimmed = raw.trim();
    let value: f64 = trimmed
        .parse()
        .map_err(|_| ScoringError::Malformed(format!("not a number: {:?}", trimmed)))?;
    if !value.is_finite() || !(MIN_SCORE..=MAX_SCORE).contains(&value) {
        return Err(ScoringError::Malformed(format!(
            "{} outside [{}, {}]",
            value, MIN_SCORE, MAX_SCORE
        )));
    }
    Ok(value)
}

/// Build the configured scorer backend.
pub fn build_scorer(config: &ScoringConfig) -> Result<Arc<dyn Scorer>, ScoringError> {
    match &config.backend {
        ScoringBackend::Http(http) => Ok(Arc::new(HttpScorer::new(http)?)),
        ScoringBackend::Lexicon => Ok(Arc::new(LexiconScorer::default())),
    }
}

/// Scoring as seen by the enrichment loop: bounded in time, never failing.
pub struct ScoringStep {
    scorer: Arc<dyn Scorer>,
    timeout: Duration,
    fallback: f64,
}

impl ScoringStep {
    pub fn new(scorer: Arc<dyn Scorer>, timeout: Duration, fallback: f64) -> Self {
        Self {
            scorer,
            timeout,
            fallback,
        }
    }

    pub fn from_config(config: &ScoringConfig) -> Result<Self, ScoringError> {
        Ok(Self::new(build_scorer(config)?, config.timeout, config.fallback))
    }

    /// Score the text of one record, substituting the fallback on any error
    /// or timeout.
    pub async fn score(&self, record_id: &str, text: &str) -> f64 {
        let result = match tokio::time::timeout(self.timeout, self.scorer.score(text)).await {
            Ok(result) => result,
            Err(_) => Err(ScoringError::Timeout(self.timeout)),
        };

        match result {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(
                    record_id = %record_id,
                    error = %e,
                    fallback = self.fallback,
                    "Scoring failed, using fallback score"
                );
                self.fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScorer(Result<f64, &'static str>);

    #[async_trait]
    impl Scorer for FixedScorer {
        async fn score(&self, _text: &str) -> Result<f64, ScoringError> {
            self.0.map_err(|m| ScoringError::Malformed(m.to_string()))
        }
    }

    struct SlowScorer;

    #[async_trait]
    impl Scorer for SlowScorer {
        async fn score(&self, _text: &str) -> Result<f64, ScoringError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(9.0)
        }
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score(" 7.5 ").unwrap(), 7.5);
        assert_eq!(parse_score("-10").unwrap(), -10.0);
        assert!(matches!(parse_score("great!"), Err(ScoringError::Malformed(_))));
        assert!(matches!(parse_score("11"), Err(ScoringError::Malformed(_))));
        assert!(matches!(parse_score("NaN"), Err(ScoringError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_step_passes_through_score() {
        let step = ScoringStep::new(Arc::new(FixedScorer(Ok(3.0))), Duration::from_secs(1), 0.0);
        assert_eq!(step.score("r1", "text").await, 3.0);
    }

    #[tokio::test]
    async fn test_step_falls_back_on_error() {
        let step = ScoringStep::new(
            Arc::new(FixedScorer(Err("garbage"))),
            Duration::from_secs(1),
            NEUTRAL_SCORE,
        );
        assert_eq!(step.score("r1", "text").await, NEUTRAL_SCORE);
    }

    #[tokio::test]
    async fn test_step_falls_back_on_timeout() {
        let step = ScoringStep::new(Arc::new(SlowScorer), Duration::from_millis(20), -1.0);
        assert_eq!(step.score("r1", "text").await, -1.0);
    }
}
