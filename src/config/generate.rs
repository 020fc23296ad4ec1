pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# SCORESTREAM CONFIGURATION
# =============================================================================
# Three stages share one partitioned log:
#
#   generate:   publishes raw text records to generator.stream
#   enrich:     scores records from enrichment.input_stream and republishes
#               them to enrichment.output_stream
#   aggregate:  averages scores over event-time windows and appends finalized
#               windows to the sink directory
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/scorestream/config.yml
#   3. /etc/scorestream/config.yml
#
# Any value may reference environment variables as $env{NAME}.

# =============================================================================
# LOG
# =============================================================================
log:
  # DuckDB file holding log entries and aggregation checkpoints
  path: ~/.local/share/scorestream/scorestream.duckdb
  streams:
    - name: tweets
      partitions: 1
    - name: scores
      partitions: 1

# =============================================================================
# CONSUMER
# =============================================================================
consumer:
  # Maximum records returned by one poll
  max_records: 100
  # Bound on a single poll call; an expired poll is retried
  poll_timeout: 5s
  # Pause after a poll that returned nothing
  idle_interval: 500ms
  retry:
    # Retries after the first failure before the stage gives up
    max_retries: 5
    initial_backoff: 200ms
    max_backoff: 10s

# =============================================================================
# GENERATOR
# =============================================================================
generator:
  stream: tweets
  interval: 5s
  # Leave empty to use the built-in phrase list
  phrases: []

# =============================================================================
# ENRICHMENT
# =============================================================================
enrichment:
  input_stream: tweets
  output_stream: scores
  # 'latest' skips records published before the stage started
  start: latest
  scoring:
    # 'lexicon' scores locally; 'http' calls a completion endpoint
    backend: lexicon
    # backend: http
    # endpoint: https://api.openai.com/v1
    # model: davinci-002
    # api_key: $env{OPENAI_API_KEY}
    # request_timeout: 30s
    timeout: 10s
    # Neutral score used when scoring fails
    fallback: 0.0

# =============================================================================
# AGGREGATION
# =============================================================================
aggregation:
  # Checkpoint key; change it to start a fresh job
  job_id: score-averages
  stream: scores
  # 'earliest' replays everything retained in the stream on first start
  start: earliest
  window: 60s
  # Uncomment for hopping windows (window must be a multiple of slide)
  # slide: 30s
  # Records whose window ends at or before the watermark are dropped
  allowed_lateness: 30s
  # Cadence of window emission and checkpointing
  batch_interval: 10s
  sink:
    path: ~/.local/share/scorestream/aggregates
    partition_column: date
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_starter_config_is_valid() {
        let config = parse_config(&generate_starter_config()).unwrap();
        assert_eq!(config.log.streams.len(), 2);
        assert_eq!(config.aggregation.job_id, "score-averages");
        assert!(config.aggregation.slide.is_none());
    }
}
