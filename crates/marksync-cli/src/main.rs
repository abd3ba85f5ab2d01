//! marksync CLI
//!
//! Command-line interface and daemon for marksync - bookmark sync across
//! browsers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use marksync_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "marksync")]
#[command(about = "marksync - Keep browser bookmarks in one tag-merged store")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (overrides log_level in config)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch every source and sync on change until interrupted
    Daemon,
    /// Load every source once
    Sync,
    /// List stored bookmarks
    #[command(alias = "ls")]
    List {
        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Show sources and storage status
    Status,
    /// Show or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.clone().unwrap_or_else(Config::config_file_path);

    // Init must work before any config exists
    if let Commands::Config {
        command: Some(ConfigCommands::Init { force }),
    } = &cli.command
    {
        return commands::config::init(&config_path, *force, &output);
    }

    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    match cli.command {
        Commands::Daemon => commands::daemon::run(&config, &output).await,
        Commands::Sync => {
            let config = config.clone();
            let output = Output::new(output.format);
            tokio::task::spawn_blocking(move || commands::sync::sync(&config, &output)).await?
        }
        Commands::List { tag } => commands::list::list(&config, tag, &output),
        Commands::Status => commands::status::show(&config, &output),
        Commands::Config { .. } => commands::config::show(&config, &config_path, &output),
    }
}

/// Log to stderr, filtered by RUST_LOG or the given level
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "marksync_core={},marksync_cli={}",
            log_level, log_level
        ))
    });

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
