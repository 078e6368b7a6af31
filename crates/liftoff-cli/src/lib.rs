//! Liftoff CLI - command-line front end for the `liftoff-devserver` session core.
//!
//! # Architecture
//!
//! - [`cli`] - Argument definitions (clap derive)
//! - [`config`] - Layered configuration loading with figment
//! - [`commands`] - Command implementations, including the dev restart loop
//! - [`error`] - CLI error types and miette conversion
//! - [`logger`] - tracing subscriber setup, optionally redirected to a file
//! - [`ui`] - Status messages and the interactive console UI

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod ui;

pub use error::{CliError, ConfigError, Result, ResultExt};
