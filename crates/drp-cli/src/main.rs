mod commands;
mod progress;
mod summary;

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drp_core::config::DrpConfig;
use drp_core::paths;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "drp", about = "Astronomical image reduction pipeline")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    level: String,

    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reduce a night of raw images
    Run(commands::run::RunArgs),
    /// Watch a raw directory and reduce new images as they arrive
    Monitor(commands::monitor::MonitorArgs),
    /// Print or save the default configuration
    Config(commands::config::ConfigArgs),
    /// List built-in processors and instrument configurations
    Processors(commands::processors::ProcessorsArgs),
    /// Show FITS header and layout
    Info(commands::info::InfoArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DrpConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // The monitor also keeps a per-night processing log.
    let log_file = match &cli.command {
        Commands::Monitor(args) => {
            let path = paths::processing_log_path(
                &config.paths.output_data_dir,
                &commands::resolve_night(args.night.as_deref()),
            );
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            Some(
                File::options()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("Failed to open log {}", path.display()))?,
            )
        }
        _ => None,
    };
    init_logging(&cli, log_file);

    match &cli.command {
        Commands::Run(args) => commands::run::run(args, &config),
        Commands::Monitor(args) => commands::monitor::run(args, &config),
        Commands::Config(args) => commands::config::run(args, &config),
        Commands::Processors(args) => commands::processors::run(args),
        Commands::Info(args) => commands::info::run(args),
    }
}

fn init_logging(cli: &Cli, log_file: Option<File>) {
    let level = if cli.verbose { "debug" } else { cli.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(Mutex::new(file))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
}
