//! Line-based interactive UI for a dev session.
//!
//! Prints the server URL, a spinner while targets compile, build outcomes, proxied
//! requests, and restart notices. Typing `q` + Enter asks the session to exit.

use super::format::format_duration;
use super::messages::{Tone, line};
use super::spinner::Spinner;
use liftoff_devserver::{
    BuildStats, DevServerStatus, ExitCallback, ProxyLogRecord, SessionUi, Subscription, UiFeeds,
    UiHandle,
};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Once};
use std::time::Duration;

/// Lines of a failed target's stderr shown under the failure.
const STDERR_LINES: usize = 12;

/// Console presentation of a running session.
///
/// One `ConsoleUi` can be mounted by successive sessions; the quit key always reaches
/// the session mounted last.
pub struct ConsoleUi {
    exit: Arc<Mutex<Option<ExitCallback>>>,
    read_stdin: bool,
    stdin_listener: Once,
}

impl ConsoleUi {
    pub fn new() -> Self {
        Self {
            exit: Arc::new(Mutex::new(None)),
            read_stdin: true,
            stdin_listener: Once::new(),
        }
    }

    /// Don't read the quit key from stdin.
    pub fn without_quit_key(mut self) -> Self {
        self.read_stdin = false;
        self
    }

    fn listen_for_quit(&self) {
        if !self.read_stdin {
            return;
        }
        self.stdin_listener.call_once(|| {
            let exit = Arc::clone(&self.exit);
            let spawned = std::thread::Builder::new()
                .name("liftoff-quit-key".to_string())
                .spawn(move || {
                    for input in std::io::stdin().lines() {
                        let Ok(input) = input else { break };
                        if !matches!(input.trim(), "q" | "quit") {
                            continue;
                        }
                        let callback = exit.lock().clone();
                        if let Some(callback) = callback {
                            callback();
                        }
                    }
                });
            if let Err(e) = spawned {
                tracing::warn!("Quit key unavailable: {e}");
            }
        });
    }
}

impl Default for ConsoleUi {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionUi for ConsoleUi {
    fn mount(&self, feeds: UiFeeds) -> liftoff_devserver::Result<Box<dyn UiHandle>> {
        let printer = Arc::new(Printer::default());

        printer.line(line(
            Tone::Success,
            &format!("Dev server running at {}", feeds.url.bold()),
        ));
        if let Some(path) = &feeds.log_file {
            printer.line(line(Tone::Info, &format!("Logs: {}", path.display())));
        }
        if self.read_stdin {
            printer.line(format!("{}", "Type q + Enter to quit".dimmed()));
        }

        let mut subscriptions = vec![
            feeds.stats.subscribe({
                let printer = Arc::clone(&printer);
                move |stats| printer.on_stats(stats)
            }),
            feeds.status.subscribe({
                let printer = Arc::clone(&printer);
                move |status| {
                    if *status == DevServerStatus::Closing {
                        printer.line(line(Tone::Info, "Shutting down..."));
                    }
                }
            }),
        ];

        if let Some(records) = &feeds.proxy_log {
            let printer = Arc::clone(&printer);
            let last_shown = Mutex::new(0u64);
            subscriptions.push(records.subscribe(move |batch| {
                let mut last_shown = last_shown.lock();
                for record in unseen(batch, *last_shown) {
                    printer.line(format_proxy_record(record));
                }
                if let Some(last) = batch.last() {
                    *last_shown = (*last_shown).max(last.seq);
                }
            }));
        }

        if let Some(alarm) = &feeds.restart_alarm {
            let printer = Arc::clone(&printer);
            subscriptions.push(alarm.subscribe(move |files| {
                if !files.is_empty() {
                    printer.line(line(
                        Tone::Warning,
                        &format!("Restarting: {} changed", files.join(", ")),
                    ));
                }
            }));
        }

        *self.exit.lock() = Some(feeds.exit);
        self.listen_for_quit();

        Ok(Box::new(ConsoleHandle {
            subscriptions,
            printer,
            exit: Arc::clone(&self.exit),
        }))
    }
}

struct ConsoleHandle {
    subscriptions: Vec<Subscription>,
    printer: Arc<Printer>,
    exit: Arc<Mutex<Option<ExitCallback>>>,
}

impl UiHandle for ConsoleHandle {
    fn unmount(self: Box<Self>) -> liftoff_devserver::Result<()> {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        *self.exit.lock() = None;
        self.printer.clear();
        Ok(())
    }
}

/// Serializes terminal writes with the compile spinner.
#[derive(Default)]
struct Printer {
    spinner: Mutex<Option<Spinner>>,
}

impl Printer {
    fn line(&self, text: String) {
        match &*self.spinner.lock() {
            Some(spinner) if !spinner.is_hidden() => spinner.println(&text),
            _ => eprintln!("{text}"),
        }
    }

    fn on_stats(&self, stats: &BuildStats) {
        match stats {
            BuildStats::Waiting => {}
            BuildStats::Invalid => {
                let mut spinner = self.spinner.lock();
                if spinner.is_none() {
                    *spinner = Some(Spinner::new("Compiling..."));
                }
            }
            BuildStats::Done { stats } => {
                let summary = BuildSummary::from_stats(stats.as_value());
                let message = summary.headline();
                match self.spinner.lock().take() {
                    Some(spinner) if summary.failures.is_empty() => spinner.finish(&message),
                    Some(spinner) => spinner.fail(&message),
                    None => {
                        let tone = if summary.failures.is_empty() {
                            Tone::Success
                        } else {
                            Tone::Error
                        };
                        eprintln!("{}", line(tone, &message));
                    }
                }
                for failure in &summary.failures {
                    for stderr_line in failure.stderr_tail() {
                        eprintln!("    {}", stderr_line.dimmed());
                    }
                }
            }
        }
    }

    fn clear(&self) {
        if let Some(spinner) = self.spinner.lock().take() {
            spinner.clear();
        }
    }
}

/// Records of `batch` newer than `last_shown`.
///
/// The log republishes its whole buffer, so everything up to the last record already
/// printed is skipped. If that record was evicted, the whole batch is new.
fn unseen(batch: &[ProxyLogRecord], last_shown: u64) -> &[ProxyLogRecord] {
    let start = batch.partition_point(|r| r.seq <= last_shown);
    &batch[start..]
}

fn format_proxy_record(record: &ProxyLogRecord) -> String {
    let text = record.to_string();
    let failed = record.request.error.is_some()
        || record.request.status.is_some_and(|status| status >= 500);
    if !super::colors_enabled() {
        text
    } else if failed {
        format!("{}", text.red())
    } else {
        format!("{}", text.dimmed())
    }
}

#[derive(Debug, PartialEq)]
struct TargetFailure {
    name: String,
    exit_code: Option<i64>,
    stderr: String,
}

impl TargetFailure {
    fn stderr_tail(&self) -> Vec<&str> {
        let lines: Vec<&str> = self.stderr.lines().collect();
        lines[lines.len().saturating_sub(STDERR_LINES)..].to_vec()
    }
}

/// What the console shows about one finished compile.
#[derive(Debug, PartialEq)]
struct BuildSummary {
    targets: usize,
    duration_ms: Option<u64>,
    failures: Vec<TargetFailure>,
}

impl BuildSummary {
    /// Read compiler stats. Unknown shapes count as a successful compile.
    fn from_stats(value: &Value) -> Self {
        let targets = value
            .get("targets")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let failures = targets
            .iter()
            .filter(|t| !t.get("success").and_then(Value::as_bool).unwrap_or(true))
            .map(|t| TargetFailure {
                name: t
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string(),
                exit_code: t.get("exitCode").and_then(Value::as_i64),
                stderr: t
                    .get("stderr")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect();

        Self {
            targets: targets.len(),
            duration_ms: value.get("durationMs").and_then(Value::as_u64),
            failures,
        }
    }

    fn headline(&self) -> String {
        if !self.failures.is_empty() {
            let names: Vec<String> = self
                .failures
                .iter()
                .map(|f| match f.exit_code {
                    Some(code) => format!("{} (exit {})", f.name, code),
                    None => f.name.clone(),
                })
                .collect();
            return format!("Build failed: {}", names.join(", "));
        }

        let what = match self.targets {
            0 => "Build finished".to_string(),
            1 => "Compiled 1 target".to_string(),
            n => format!("Compiled {n} targets"),
        };
        match self.duration_ms {
            Some(ms) => format!("{what} in {}", format_duration(Duration::from_millis(ms))),
            None => what,
        }
    }
}
