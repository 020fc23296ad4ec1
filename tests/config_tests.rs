use scorestream::config::types::ScoringBackend;
use scorestream::config::{generate::generate_starter_config, load_config, ConfigError};
use scorestream::log::StartPolicy;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_generated_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, generate_starter_config()).unwrap();

    let config = load_config(&config_path).expect("Generated config should be valid");

    let names: Vec<_> = config.log.streams.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["tweets", "scores"]);
    assert_eq!(config.generator.interval, Duration::from_secs(5));
    assert_eq!(config.enrichment.start, StartPolicy::Latest);
    assert!(matches!(config.enrichment.scoring.backend, ScoringBackend::Lexicon));
    assert_eq!(config.aggregation.start, StartPolicy::Earliest);
    assert_eq!(config.aggregation.window, Duration::from_secs(60));
    assert!(config.aggregation.slide.is_none());
    assert_eq!(config.aggregation.sink.partition_column, "date");
    // Tilde paths are expanded on load
    assert!(!config.log.path.starts_with("~"));
}

#[test]
fn test_http_backend_with_env_key() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    std::env::set_var("SCORESTREAM_IT_API_KEY", "sk-test");

    let config_yaml = format!(
        r#"
log:
  path: {}/log.duckdb
  streams:
    - name: tweets
    - name: scores
enrichment:
  input_stream: tweets
  output_stream: scores
  scoring:
    backend: http
    endpoint: https://api.openai.com/v1
    model: davinci-002
    api_key: $env{{SCORESTREAM_IT_API_KEY}}
    timeout: 3s
aggregation:
  job_id: hopping
  stream: scores
  window: 60s
  slide: 20s
  allowed_lateness: -5s
  sink:
    path: {}/out
"#,
        temp_dir.path().display(),
        temp_dir.path().display()
    );
    fs::write(&config_path, config_yaml).unwrap();

    let config = load_config(&config_path).unwrap();
    match &config.enrichment.scoring.backend {
        ScoringBackend::Http(http) => {
            assert_eq!(http.model, "davinci-002");
            assert_eq!(http.api_key.as_deref(), Some("sk-test"));
        }
        ScoringBackend::Lexicon => panic!("expected http backend"),
    }
    assert_eq!(config.enrichment.scoring.timeout, Duration::from_secs(3));
    assert_eq!(config.aggregation.slide, Some(Duration::from_secs(20)));
    assert!(config.aggregation.allowed_lateness.negative);
    assert_eq!(config.aggregation.allowed_lateness.clamped(), Duration::ZERO);
}

#[test]
fn test_invalid_config_reports_every_problem() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    let config_yaml = r#"
log:
  path: /tmp/scorestream-test.duckdb
  streams:
    - name: tweets
enrichment:
  input_stream: tweets
  output_stream: tweets
  scoring:
    backend: lexicon
aggregation:
  job_id: ""
  stream: scores
  window: 60s
  sink:
    path: /tmp/out
"#;
    fs::write(&config_path, config_yaml).unwrap();

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert!(errors.iter().any(|e| e.contains("must differ")));
            assert!(errors.iter().any(|e| e.contains("job_id cannot be empty")));
            assert!(errors.iter().any(|e| e.contains("undeclared stream 'scores'")));
        }
        other => panic!("expected validation errors, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_missing_file_is_io_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = load_config(&temp_dir.path().join("absent.yml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}
