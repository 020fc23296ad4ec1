use crate::aggregate::{AggregationJob, CheckpointManager};
use crate::config::parse::load_config;
use crate::config::Config;
use crate::enrich::EnrichmentStage;
use crate::generator::Generator;
use crate::log::PartitionedLog;
use crate::scoring::ScoringStep;
use crate::sink::FileSink;
use crate::stage::{shutdown_channel, StageError};
use crate::storage::DuckDbStorage;
use crate::stream::{StreamConsumer, StreamProducer};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: StageError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum Stage {
    Generate,
    Enrich,
    Aggregate,
    All,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Generate => "generate",
            Stage::Enrich => "enrich",
            Stage::Aggregate => "aggregate",
            Stage::All => "all",
        }
    }
}

/// Expand `all` and an empty selection to every stage, in pipeline order.
pub fn select_stages(requested: &[Stage]) -> Vec<Stage> {
    if requested.is_empty() || requested.contains(&Stage::All) {
        return vec![Stage::Generate, Stage::Enrich, Stage::Aggregate];
    }
    requested
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub async fn run(
    config_path: Option<PathBuf>,
    stages: Vec<Stage>,
    reset_checkpoint: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/scorestream/config.yml");
            eprintln!("  /etc/scorestream/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'scorestream config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_pipeline(&config_path, &select_stages(&stages), reset_checkpoint)
        .await
        .map_err(|e| e.into())
}

async fn run_pipeline(
    config_path: &Path,
    stages: &[Stage],
    reset_checkpoint: bool,
) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let storage = open_storage(&config).await?;
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    let mut tasks = JoinSet::new();
    for &stage in stages {
        spawn_stage(
            &mut tasks,
            stage,
            &config,
            storage.clone(),
            shutdown_rx.clone(),
            reset_checkpoint,
        )?;
    }

    let names: Vec<_> = stages.iter().map(|s| s.name()).collect();
    info!(stages = ?names, "Pipeline started, press Ctrl+C to shutdown");

    let mut first_error: Option<RunError> = None;
    let mut shutting_down = false;

    loop {
        tokio::select! {
            _ = signal::ctrl_c(), if !shutting_down => {
                info!("Shutdown signal received");
                shutting_down = true;
                let _ = shutdown_tx.send(true);
            }
            joined = tasks.join_next() => {
                let Some(joined) = joined else { break };
                let (stage, result) = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => ("unknown", Err(StageError::Join(e.to_string()))),
                };

                match result {
                    Ok(()) => info!(stage, "Stage stopped"),
                    Err(e) => {
                        error!(stage, error = %e, "Stage failed, stopping pipeline");
                        if first_error.is_none() {
                            first_error = Some(RunError::Stage { stage, source: e });
                        }
                    }
                }

                if !shutting_down {
                    shutting_down = true;
                    let _ = shutdown_tx.send(true);
                }
            }
        }
    }

    info!("Pipeline shutdown complete");
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn open_storage(config: &Config) -> Result<Arc<DuckDbStorage>, RunError> {
    if let Some(parent) = config.log.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!(path = %config.log.path.display(), "Initializing storage");
    let storage = DuckDbStorage::new(&config.log.path)?;
    storage.init_schema().await?;
    for stream in &config.log.streams {
        storage.create_stream(&stream.name, stream.partitions).await?;
    }
    Ok(Arc::new(storage))
}

type StageResult = (&'static str, Result<(), StageError>);

fn spawn_stage(
    tasks: &mut JoinSet<StageResult>,
    stage: Stage,
    config: &Config,
    storage: Arc<DuckDbStorage>,
    shutdown: watch::Receiver<bool>,
    reset_checkpoint: bool,
) -> Result<(), RunError> {
    let log: Arc<dyn PartitionedLog> = storage.clone();

    match stage {
        Stage::Generate => {
            let producer = StreamProducer::new(log, config.generator.stream.clone());
            let generator = Generator::new(&config.generator, producer, shutdown);
            tasks.spawn(async move {
                generator.run().await;
                ("generate", Ok(()))
            });
        }
        Stage::Enrich => {
            let enrichment = config.enrichment.clone();
            let scoring = ScoringStep::from_config(&enrichment.scoring).map_err(|e| {
                RunError::Stage {
                    stage: "enrich",
                    source: e.into(),
                }
            })?;
            let consumer = StreamConsumer::new(
                log.clone(),
                enrichment.input_stream.clone(),
                config.consumer.clone(),
                shutdown.clone(),
            );
            let producer = StreamProducer::new(log, enrichment.output_stream.clone());
            let stage =
                EnrichmentStage::new(producer, scoring, config.consumer.retry.clone(), shutdown);

            tasks.spawn(async move {
                let result = stage
                    .run(consumer, enrichment.partition.as_deref(), enrichment.start)
                    .await;
                ("enrich", ignore_cancelled(result.map(|_| ())))
            });
        }
        Stage::Aggregate => {
            let aggregation = config.aggregation.clone();
            let consumer = StreamConsumer::new(
                log,
                aggregation.stream.clone(),
                config.consumer.clone(),
                shutdown.clone(),
            );
            let checkpoints = CheckpointManager::new(storage, aggregation.job_id.clone());
            let sink = Arc::new(FileSink::new(aggregation.sink.path.clone()));

            tasks.spawn(async move {
                let result = async {
                    if reset_checkpoint {
                        checkpoints.reset().await?;
                    }
                    let job =
                        AggregationJob::start(&aggregation, consumer, checkpoints, sink, shutdown)
                            .await?;
                    let stats = job.run().await?;
                    info!(
                        ingested = stats.ingested,
                        late_dropped = stats.late_dropped,
                        windows_emitted = stats.windows_emitted,
                        "Aggregation totals"
                    );
                    Ok::<(), StageError>(())
                }
                .await;
                ("aggregate", ignore_cancelled(result))
            });
        }
        Stage::All => {
            for stage in select_stages(&[Stage::All]) {
                spawn_stage(
                    tasks,
                    stage,
                    config,
                    storage.clone(),
                    shutdown.clone(),
                    reset_checkpoint,
                )?;
            }
        }
    }
    Ok(())
}

fn ignore_cancelled(result: Result<(), StageError>) -> Result<(), StageError> {
    match result {
        Err(e) if e.is_cancelled() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_stages() {
        assert_eq!(
            select_stages(&[]),
            vec![Stage::Generate, Stage::Enrich, Stage::Aggregate]
        );
        assert_eq!(
            select_stages(&[Stage::Aggregate, Stage::All]),
            vec![Stage::Generate, Stage::Enrich, Stage::Aggregate]
        );
        assert_eq!(
            select_stages(&[Stage::Aggregate, Stage::Enrich, Stage::Aggregate]),
            vec![Stage::Enrich, Stage::Aggregate]
        );
    }
}
