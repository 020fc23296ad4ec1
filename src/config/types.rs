use crate::log::StartPolicy;
use crate::stream::ConsumerSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log: LogConfig,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub generator: GeneratorConfig,
    pub enrichment: EnrichmentConfig,
    pub aggregation: AggregationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// DuckDB file holding the log and the checkpoints.
    pub path: PathBuf,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

fn default_partitions() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_stream")]
    pub stream: String,
    #[serde(default = "default_generator_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Phrases to draw record text from; a built-in list when empty.
    #[serde(default)]
    pub phrases: Vec<String>,
}

fn default_generator_stream() -> String {
    "tweets".to_string()
}

fn default_generator_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            stream: default_generator_stream(),
            interval: default_generator_interval(),
            phrases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    pub input_stream: String,
    pub output_stream: String,
    pub partition: Option<String>,
    #[serde(default = "default_enrichment_start")]
    pub start: StartPolicy,
    pub scoring: ScoringConfig,
}

fn default_enrichment_start() -> StartPolicy {
    StartPolicy::Latest
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(flatten)]
    pub backend: ScoringBackend,
    /// Bound on one scoring call before the fallback is used.
    #[serde(default = "default_scoring_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub fallback: f64,
}

fn default_scoring_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum ScoringBackend {
    Http(HttpScorerConfig),
    Lexicon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpScorerConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub job_id: String,
    pub stream: String,
    pub partition: Option<String>,
    #[serde(default = "default_aggregation_start")]
    pub start: StartPolicy,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Hop between window starts; windows tumble when absent.
    #[serde(default, with = "humantime_serde")]
    pub slide: Option<Duration>,
    #[serde(default = "default_allowed_lateness")]
    pub allowed_lateness: SignedDuration,
    #[serde(default = "default_batch_interval", with = "humantime_serde")]
    pub batch_interval: Duration,
    pub sink: SinkConfig,
}

fn default_aggregation_start() -> StartPolicy {
    StartPolicy::Earliest
}

fn default_allowed_lateness() -> SignedDuration {
    SignedDuration::from_secs(30)
}

fn default_batch_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub path: PathBuf,
    #[serde(default = "default_partition_column")]
    pub partition_column: String,
}

fn default_partition_column() -> String {
    "date".to_string()
}

/// A duration that may be written with a leading `-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SignedDuration {
    pub negative: bool,
    pub magnitude: Duration,
}

impl SignedDuration {
    pub fn from_secs(secs: u64) -> Self {
        Self {
            negative: false,
            magnitude: Duration::from_secs(secs),
        }
    }

    /// The duration with negative values treated as zero.
    pub fn clamped(&self) -> Duration {
        if self.negative {
            Duration::ZERO
        } else {
            self.magnitude
        }
    }
}

impl TryFrom<String> for SignedDuration {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let trimmed = s.trim();
        let (negative, rest) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed),
        };
        let magnitude = humantime_serde::re::humantime::parse_duration(rest)
            .map_err(|e| format!("invalid duration '{}': {}", s, e))?;
        Ok(Self {
            negative: negative && !magnitude.is_zero(),
            magnitude,
        })
    }
}

impl From<SignedDuration> for String {
    fn from(d: SignedDuration) -> Self {
        let formatted = humantime_serde::re::humantime::format_duration(d.magnitude).to_string();
        if d.negative {
            format!("-{}", formatted)
        } else {
            formatted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_duration_parse() {
        let d = SignedDuration::try_from("30s".to_string()).unwrap();
        assert!(!d.negative);
        assert_eq!(d.clamped(), Duration::from_secs(30));

        let d = SignedDuration::try_from("-2m".to_string()).unwrap();
        assert!(d.negative);
        assert_eq!(d.magnitude, Duration::from_secs(120));
        assert_eq!(d.clamped(), Duration::ZERO);

        assert!(SignedDuration::try_from("soon".to_string()).is_err());
    }

    #[test]
    fn test_scoring_backend_tagging() {
        let yaml = "backend: http\nendpoint: http://localhost:8080/v1\nmodel: davinci-002\ntimeout: 5s\n";
        let config: ScoringConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.backend, ScoringBackend::Http(_)));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.fallback, 0.0);

        let config: ScoringConfig = serde_yaml::from_str("backend: lexicon\n").unwrap();
        assert!(matches!(config.backend, ScoringBackend::Lexicon));
    }
}
