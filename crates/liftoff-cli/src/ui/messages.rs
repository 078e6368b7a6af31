//! Status message functions for terminal output.

use owo_colors::OwoColorize;

/// Kind of status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Success,
    Info,
    Warning,
    Error,
}

impl Tone {
    fn symbol(self) -> &'static str {
        match self {
            Tone::Success => "✓",
            Tone::Info => "ℹ",
            Tone::Warning => "⚠",
            Tone::Error => "✗",
        }
    }
}

/// Format a status line, colored unless colors are disabled.
pub fn line(tone: Tone, message: &str) -> String {
    let symbol = tone.symbol();
    if !super::colors_enabled() {
        return format!("{symbol} {message}");
    }
    match tone {
        Tone::Success => format!("{} {}", symbol.green().bold(), message),
        Tone::Info => format!("{} {}", symbol.blue().bold(), message),
        Tone::Warning => format!("{} {}", symbol.yellow().bold(), message.yellow()),
        Tone::Error => format!("{} {}", symbol.red().bold(), message.red()),
    }
}

/// Print a success message to stderr.
pub fn success(message: &str) {
    eprintln!("{}", line(Tone::Success, message));
}

/// Print an info message to stderr.
pub fn info(message: &str) {
    eprintln!("{}", line(Tone::Info, message));
}

/// Print a warning message to stderr.
pub fn warning(message: &str) {
    eprintln!("{}", line(Tone::Warning, message));
}

/// Print an error message to stderr.
pub fn error(message: &str) {
    eprintln!("{}", line(Tone::Error, message));
}
