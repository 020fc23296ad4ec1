use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use crate::scoring::{MAX_SCORE, MIN_SCORE};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Expand, parse and validate a YAML config document.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml)?;
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    if config.aggregation.allowed_lateness.negative {
        tracing::warn!(
            allowed_lateness = %String::from(config.aggregation.allowed_lateness),
            "Negative allowed lateness treated as zero: every late record is dropped"
        );
    }

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    // Commented-out lines may name variables that are never set
    let active: String = yaml_string
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    let unexpanded = unexpanded_env_vars(&active)?;

    match unexpanded.len() {
        0 => Ok(()),
        1 => Err(ConfigError::Validation(format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded[0]
        ))),
        _ => Err(ConfigError::Validation(format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded.join(", ")
        ))),
    }
}

fn expand_paths(config: &mut Config) {
    config.log.path = expand_tilde(&config.log.path);
    config.aggregation.sink.path = expand_tilde(&config.aggregation.sink.path);
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_streams(config, &mut errors);
    validate_consumer(config, &mut errors);
    validate_enrichment(config, &mut errors);
    validate_aggregation(&config.aggregation, &mut errors);

    if config.generator.interval.is_zero() {
        errors.push("generator.interval must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_streams(config: &Config, errors: &mut Vec<String>) {
    if config.log.streams.is_empty() {
        errors.push("log.streams must declare at least one stream".to_string());
    }

    let mut names = HashSet::new();
    for (i, stream) in config.log.streams.iter().enumerate() {
        if stream.name.is_empty() {
            errors.push(format!("log.streams[{}]: stream name cannot be empty", i));
        } else if stream.name.contains('/') {
            errors.push(format!(
                "log.streams[{}]: stream name '{}' cannot contain '/'",
                i, stream.name
            ));
        } else if !names.insert(stream.name.as_str()) {
            errors.push(format!(
                "log.streams[{}]: duplicate stream name '{}'",
                i, stream.name
            ));
        }
        if stream.partitions == 0 {
            errors.push(format!(
                "log.streams[{}]: partitions must be greater than zero",
                i
            ));
        }
    }

    let references = [
        ("generator.stream", &config.generator.stream),
        ("enrichment.input_stream", &config.enrichment.input_stream),
        ("enrichment.output_stream", &config.enrichment.output_stream),
        ("aggregation.stream", &config.aggregation.stream),
    ];
    for (field, name) in references {
        if !names.contains(name.as_str()) {
            errors.push(format!("{}: references undeclared stream '{}'", field, name));
        }
    }

    // Consumers read a single partition; records routed elsewhere would never be seen.
    let consumed = [
        ("enrichment.input_stream", &config.enrichment.input_stream),
        ("aggregation.stream", &config.aggregation.stream),
    ];
    for (field, name) in consumed {
        let declared = config.log.streams.iter().find(|s| &s.name == name);
        if let Some(stream) = declared.filter(|s| s.partitions > 1) {
            errors.push(format!(
                "{}: stream '{}' is consumed by a single reader and must have exactly one partition (declared {})",
                field, name, stream.partitions
            ));
        }
    }
}

fn validate_consumer(config: &Config, errors: &mut Vec<String>) {
    let consumer = &config.consumer;
    if consumer.max_records == 0 {
        errors.push("consumer.max_records must be greater than zero".to_string());
    }
    if consumer.poll_timeout.is_zero() {
        errors.push("consumer.poll_timeout must be greater than zero".to_string());
    }
    if consumer.retry.max_retries == 0 {
        errors.push("consumer.retry.max_retries must be greater than zero".to_string());
    }
    if consumer.retry.initial_backoff > consumer.retry.max_backoff {
        errors.push(
            "consumer.retry.initial_backoff must not exceed consumer.retry.max_backoff"
                .to_string(),
        );
    }
}

fn validate_enrichment(config: &Config, errors: &mut Vec<String>) {
    let enrichment = &config.enrichment;
    if enrichment.input_stream == enrichment.output_stream {
        errors.push("enrichment: input_stream and output_stream must differ".to_string());
    }

    let scoring = &enrichment.scoring;
    if !(MIN_SCORE..=MAX_SCORE).contains(&scoring.fallback) {
        errors.push(format!(
            "enrichment.scoring.fallback {} is outside [{}, {}]",
            scoring.fallback, MIN_SCORE, MAX_SCORE
        ));
    }
    if scoring.timeout.is_zero() {
        errors.push("enrichment.scoring.timeout must be greater than zero".to_string());
    }
    if let ScoringBackend::Http(http) = &scoring.backend {
        if http.endpoint.is_empty() {
            errors.push("enrichment.scoring.endpoint cannot be empty".to_string());
        }
        if http.model.is_empty() {
            errors.push("enrichment.scoring.model cannot be empty".to_string());
        }
    }
}

fn validate_aggregation(aggregation: &AggregationConfig, errors: &mut Vec<String>) {
    if aggregation.job_id.is_empty() {
        errors.push("aggregation.job_id cannot be empty".to_string());
    }
    if aggregation.window.is_zero() {
        errors.push("aggregation.window must be greater than zero".to_string());
    }
    // Window keys are written with second precision.
    if aggregation.window.subsec_nanos() != 0 {
        errors.push("aggregation.window must be a whole number of seconds".to_string());
    }
    if let Some(slide) = aggregation.slide {
        if slide.subsec_nanos() != 0 {
            errors.push("aggregation.slide must be a whole number of seconds".to_string());
        }
        if slide.is_zero() {
            errors.push("aggregation.slide must be greater than zero".to_string());
        } else if slide > aggregation.window {
            errors.push("aggregation.slide must not exceed aggregation.window".to_string());
        } else if aggregation.window.as_millis() % slide.as_millis().max(1) != 0 {
            errors.push("aggregation.window must be a multiple of aggregation.slide".to_string());
        }
    }
    if aggregation.batch_interval.is_zero() {
        errors.push("aggregation.batch_interval must be greater than zero".to_string());
    }
    if aggregation.sink.partition_column != "date" {
        errors.push(format!(
            "aggregation.sink.partition_column '{}' is not supported (expected 'date')",
            aggregation.sink.partition_column
        ));
    }
}
