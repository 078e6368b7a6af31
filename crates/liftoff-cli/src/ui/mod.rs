//! Terminal output: status messages, the compile spinner, and the interactive
//! [`ConsoleUi`] mounted by dev sessions.

mod console;
mod format;
mod messages;
mod spinner;

pub use console::ConsoleUi;
pub use format::format_duration;
pub use messages::{Tone, error, info, line, success, warning};
pub use spinner::Spinner;

use std::sync::atomic::{AtomicBool, Ordering};

static COLORS: AtomicBool = AtomicBool::new(true);

/// Check if running in a CI environment.
///
/// Detects GitHub Actions, GitLab CI, CircleCI, Travis CI, and the generic `CI` variable.
pub fn is_ci() -> bool {
    ["CI", "GITHUB_ACTIONS", "GITLAB_CI", "CIRCLECI", "TRAVIS"]
        .iter()
        .any(|var| std::env::var_os(var).is_some())
}

/// Decide once whether output is colored. Call early in `main`.
pub fn init_colors(no_color: bool) {
    let enabled = !no_color && crate::logger::should_use_colors();
    COLORS.store(enabled, Ordering::Relaxed);
    ::console::set_colors_enabled(enabled);
    ::console::set_colors_enabled_stderr(enabled);
}

pub(crate) fn colors_enabled() -> bool {
    COLORS.load(Ordering::Relaxed)
}
