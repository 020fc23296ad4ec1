use clap::{Parser, Subcommand};
use scorestream::cli::run::Stage;
use scorestream::config::resolve_config_path;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scorestream")]
#[command(about = "Streaming sentiment scoring and windowed aggregation", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more pipeline stages (all of them when none are named)
    Run {
        #[arg(value_enum)]
        stages: Vec<Stage>,

        /// Discard the aggregation checkpoint before starting
        #[arg(long)]
        reset_checkpoint: bool,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter config
    Init {
        #[arg(long)]
        stdout: bool,
    },
    /// Load and validate a config without running anything
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scorestream=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Commands::Run {
            stages,
            reset_checkpoint,
        } => {
            scorestream::cli::run::run(config_path, stages, reset_checkpoint).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { stdout } => scorestream::cli::config::init(stdout)?,
            ConfigAction::Validate => scorestream::cli::config::validate(config_path)?,
        },
    }

    Ok(())
}
