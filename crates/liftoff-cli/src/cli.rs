//! Command-line interface definition.
//!
//! - `liftoff dev` - Build every target, serve them, and restart on config changes

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Liftoff - dev server for multi-target front-end and Electron builds
#[derive(Parser, Debug)]
#[command(
    name = "liftoff",
    version,
    about = "Dev server for multi-target front-end and Electron builds",
    long_about = "Liftoff builds every configured target, serves the output with live reload,\n\
                  proxies API requests, and restarts itself when configuration files change."
)]
pub struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the dev server
    ///
    /// Runs every target's build command, rebuilds on source changes, serves the
    /// output with live reload, and restarts when configuration files change.
    Dev(DevArgs),
}

/// Arguments for the dev command
#[derive(Args, Debug, Clone, Default)]
pub struct DevArgs {
    /// Configuration file (defaults to liftoff.toml or liftoff.json in the working directory)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Working directory
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Host to bind
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Port to bind; 0 picks a free port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Never mount the interactive UI
    #[arg(long)]
    pub no_interactive: bool,

    /// Write logs to this file instead of the terminal
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}
