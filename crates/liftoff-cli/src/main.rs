//! Liftoff CLI - multi-target dev server with live reload.
//!
//! Parses arguments, sets up logging, and dispatches to the command.

use clap::Parser;
use liftoff_cli::{cli, commands, error, logger, ui};
use miette::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let log_file = match &args.command {
        cli::Command::Dev(dev_args) => dev_args.log_file.as_deref(),
    };
    logger::init_logger(args.verbose, args.quiet, args.no_color, log_file)
        .map_err(error::cli_error_to_miette)?;
    ui::init_colors(args.no_color);

    let result = match args.command {
        cli::Command::Dev(dev_args) => commands::dev_execute(dev_args).await,
    };

    result.map_err(error::cli_error_to_miette)
}
