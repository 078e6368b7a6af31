//! Spinner shown while targets compile.

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::time::Duration;

/// Spinner for work without a known duration.
pub struct Spinner {
    pb: ProgressBar,
}

impl Spinner {
    /// Create and start a spinner.
    pub fn new(message: &str) -> Self {
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["◐", "◓", "◑", "◒"]);

        let pb = ProgressBar::new_spinner();
        pb.set_style(style);
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self { pb }
    }

    pub fn set_message(&self, message: &str) {
        self.pb.set_message(message.to_string());
    }

    /// Print a line above the spinner.
    ///
    /// Hidden spinners (no terminal) print nothing; check [`is_hidden`](Self::is_hidden).
    pub fn println(&self, message: &str) {
        self.pb.println(message);
    }

    pub fn is_hidden(&self) -> bool {
        self.pb.is_hidden()
    }

    /// Finish with a green checkmark.
    pub fn finish(&self, message: &str) {
        self.pb
            .finish_with_message(format!("{} {}", "✓".green(), message));
    }

    /// Finish with a red X.
    pub fn fail(&self, message: &str) {
        self.pb
            .finish_with_message(format!("{} {}", "✗".red(), message));
    }

    /// Remove the spinner without a final message.
    pub fn clear(&self) {
        self.pb.finish_and_clear();
    }
}
