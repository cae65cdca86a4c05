//! The `leaktk` command line interface.
//!
//! # Commands
//!
//! - `leaktk scan` - Scan one resource and print the response
//! - `leaktk listen` - Read JSON requests from stdin, write responses to stdout

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use leaktk_core::Config;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "leaktk",
    version,
    about = "Scan git repos, files, containers, and more for leaked secrets",
    arg_required_else_help = true
)]
struct Cli {
    /// Path to an alternate config file.
    #[arg(long, global = true, env = "LEAKTK_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan a single resource and print the response as JSON.
    Scan(commands::scan::ScanArgs),

    /// Serve scan requests over stdin/stdout, one JSON document per line.
    Listen,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("could not load config")?;
    init_logging(&config);

    match cli.command {
        Command::Scan(args) => commands::scan::run(&config, args),
        Command::Listen => commands::listen::run(&config),
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logger.level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
