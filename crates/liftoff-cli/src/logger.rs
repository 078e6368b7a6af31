//! Logging setup for the Liftoff CLI.
//!
//! Verbosity comes from `--verbose` / `--quiet`, falling back to `RUST_LOG`. With a log
//! file, output goes to that file (without ANSI colors) so the interactive UI keeps the
//! terminal to itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use liftoff_cli::logger::init_logger;
//!
//! init_logger(false, false, false, None).unwrap();
//! tracing::info!("Starting dev server");
//! ```

use crate::error::{CliError, Result, ResultExt};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const CRATES: &[&str] = &["liftoff", "liftoff_cli", "liftoff_devserver"];

/// Filter directives for the Liftoff crates at `level`.
fn directives(level: &str) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pick the log filter.
///
/// 1. `verbose`: DEBUG for Liftoff crates
/// 2. `quiet`: ERROR only
/// 3. `RUST_LOG`, when set and valid
/// 4. INFO for Liftoff crates
pub fn build_filter(verbose: bool, quiet: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new(directives("debug"))
    } else if quiet {
        EnvFilter::new(directives("error"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives("info")))
    }
}

/// Install the global tracing subscriber.
///
/// Call once, before any logging happens.
///
/// # Errors
///
/// Returns error if the log file cannot be opened or a subscriber is already installed.
pub fn init_logger(
    verbose: bool,
    quiet: bool,
    no_color: bool,
    log_file: Option<&Path>,
) -> Result<()> {
    let filter = build_filter(verbose, quiet);

    let (file_layer, terminal_layer) = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_path(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_path(path)?;
            let layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        None => {
            let layer = fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_ansi(!no_color)
                .with_writer(std::io::stderr)
                .compact();
            (None, Some(layer))
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(terminal_layer)
        .try_init()
        .map_err(|e| CliError::Custom(format!("Failed to initialize logging: {e}")))
}

/// Whether colored output should be used.
///
/// `NO_COLOR` wins over `FORCE_COLOR`; otherwise the terminal decides.
pub fn should_use_colors() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    console::Term::stderr().features().colors_supported()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_directives_cover_every_crate() {
        assert_eq!(
            directives("debug"),
            "liftoff=debug,liftoff_cli=debug,liftoff_devserver=debug"
        );
    }

    #[test]
    fn test_verbose_filter() {
        let filter = build_filter(true, false);
        assert!(filter.to_string().contains("liftoff_devserver=debug"));
    }

    #[test]
    fn test_quiet_filter() {
        let filter = build_filter(false, true);
        assert!(filter.to_string().contains("liftoff=error"));
    }

    #[test]
    #[serial]
    fn test_default_filter_without_rust_log() {
        unsafe { std::env::remove_var("RUST_LOG") };
        let filter = build_filter(false, false);
        assert!(filter.to_string().contains("liftoff_cli=info"));
    }

    #[test]
    #[serial]
    fn test_no_color_overrides_force_color() {
        unsafe {
            std::env::set_var("NO_COLOR", "1");
            std::env::set_var("FORCE_COLOR", "1");
        }
        assert!(!should_use_colors());
        unsafe { std::env::remove_var("NO_COLOR") };
        assert!(should_use_colors());
        unsafe { std::env::remove_var("FORCE_COLOR") };
    }
}
