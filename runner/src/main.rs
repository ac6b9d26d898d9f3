use clap::Parser;
use sgi_runner::{config::RunnerConfig, surrogate::run_local};
use std::{path::PathBuf, process::exit};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sgi-runner", version)]
#[command(about = "Builds a sparse grid surrogate on an elastic pool of ranks")]
struct Cli {
    /// YAML run configuration
    #[arg(short, long, default_value = "sgi.yaml")]
    config: PathBuf,
    /// initial pool size, overrides `ranks` from the config
    #[arg(short, long)]
    ranks: Option<usize>,
    /// shared state directory, overrides `output` from the config
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_thread_names(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match RunnerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {}: {e}", cli.config.to_string_lossy());
            exit(1)
        }
    };

    if let Some(ranks) = cli.ranks {
        config.ranks = ranks;
    }
    if let Some(output) = cli.output {
        config.output = output;
    }

    if config.preflight_checks() {
        error!("Config contains errors, stopping");
        exit(1)
    }

    match run_local(&config) {
        Ok(summary) => {
            info!(
                rounds = summary.rounds,
                points = summary.points,
                size = summary.size,
                generation = summary.generation,
                "Surrogate built"
            );

            if !summary.best.is_set() {
                error!("No grid point produced a usable posterior");
                exit(1)
            }

            info!(
                index = summary.best.index,
                posterior = summary.best.value,
                coordinates = ?summary.coordinates,
                "Max posterior"
            );
        }
        Err(e) => {
            error!("Build failed: {e}");
            exit(1)
        }
    }
}
