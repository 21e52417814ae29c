use anyhow::Result;
use clap::{Parser, Subcommand};
use hipster_core::Config;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;
mod manager;

#[derive(Parser)]
#[command(name = "hipster-worker")]
#[command(about = "Run database-migration CI jobs from a job queue", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.config/turbo-hipster/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a spool of jobs through the configured plugins
    Run {
        /// File with one JSON job per line: {"function", "unique"?, "arguments"}
        #[arg(short, long)]
        jobs: PathBuf,
    },

    /// List configured plugins and the functions they register
    Plugins {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Check a finished migration log for incomplete migrations
    CheckLog {
        /// Log file
        file: PathBuf,
    },

    /// Show or initialize the config file
    Config {
        /// Print the config file path
        #[arg(long)]
        path: bool,

        /// Write a sample config if none exists
        #[arg(long)]
        init: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load_default()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { jobs } => {
            let config = load_config(cli.config.as_deref())?;
            commands::run::run(config, &jobs).await?;
        }
        Commands::Plugins { json } => {
            let config = load_config(cli.config.as_deref())?;
            commands::plugins::run(&config, json).await?;
        }
        Commands::CheckLog { file } => {
            commands::check_log::run(&file).await?;
        }
        Commands::Config { path, init } => {
            commands::config::run(cli.config.as_deref(), path, init).await?;
        }
    }

    Ok(())
}
