//! Multi-target compiler that shells out to one build command per target.
//!
//! Each target's `command` runs once on `watch`, then again whenever a file under any
//! target's `watch` paths changes. Every rebuild is reported as `invalid` followed by
//! `done` carrying a [`MultiStats`] summary. Rebuilds always cover every target so the
//! `done` stats describe the whole multi-target compile.

use crate::compiler::{BuildTarget, BuildTargets, Compiler, CompilerHooks};
use crate::error::{DevServerError, Result};
use crate::status::StatsData;
use crate::watcher::{DEFAULT_IGNORE, FileChange, FileWatcher};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bytes of stderr kept per target in the stats.
const STDERR_TAIL: usize = 4096;

/// How long `close` waits for an in-flight build before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of building one target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStats {
    pub name: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stderr: String,
}

/// Result of building every target once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiStats {
    /// Fingerprint of the build outputs
    pub hash: String,
    pub duration_ms: u64,
    pub targets: Vec<TargetStats>,
}

impl MultiStats {
    /// Whether any target failed.
    pub fn has_errors(&self) -> bool {
        self.targets.iter().any(|t| !t.success)
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Compiler running external build commands.
pub struct CommandCompiler {
    cwd: PathBuf,
    ignore_patterns: Vec<String>,
    debounce_ms: u64,
    running: Mutex<Option<Running>>,
}

impl CommandCompiler {
    /// Create a compiler running commands from `cwd`.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ignore_patterns: DEFAULT_IGNORE.iter().map(|p| p.to_string()).collect(),
            debounce_ms: 100,
            running: Mutex::new(None),
        }
    }

    /// Replace the watcher ignore patterns.
    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    /// Set the debounce window for file changes.
    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }
}

#[async_trait]
impl Compiler for CommandCompiler {
    async fn watch(&self, targets: BuildTargets, hooks: CompilerHooks) -> Result<()> {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            return Err(DevServerError::Compiler(
                "compiler is already watching".to_string(),
            ));
        }

        let mut roots: Vec<PathBuf> = targets
            .as_slice()
            .iter()
            .flat_map(|t| t.watch.iter().map(|p| self.resolve(p)))
            .collect();
        roots.sort();
        roots.dedup();

        let watcher = if roots.is_empty() {
            tracing::debug!("No watch paths configured; building once");
            None
        } else {
            Some(FileWatcher::new(
                roots,
                self.ignore_patterns.clone(),
                self.debounce_ms,
            )?)
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(build_loop(
            targets.into_vec(),
            self.cwd.clone(),
            Duration::from_millis(self.debounce_ms),
            watcher,
            hooks,
            cancel.clone(),
        ));

        *guard = Some(Running { cancel, task });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.cancel.cancel();
        let mut task = running.task;

        match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_err)) => Err(DevServerError::Compiler(format!(
                "build task panicked: {join_err}"
            ))),
            Err(_) => {
                tracing::warn!("Build still running after {:?}; aborting", CLOSE_TIMEOUT);
                task.abort();
                Ok(())
            }
        }
    }
}

async fn build_loop(
    targets: Vec<BuildTarget>,
    cwd: PathBuf,
    debounce: Duration,
    watcher: Option<(FileWatcher, mpsc::Receiver<FileChange>)>,
    hooks: CompilerHooks,
    cancel: CancellationToken,
) {
    if !cancel.is_cancelled() {
        let stats = build_all(&targets, &cwd).await;
        report(&hooks, &stats);
    }

    let Some((_watcher, mut changes)) = watcher else {
        cancel.cancelled().await;
        return;
    };

    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };

        tracing::info!(path = %change.path().display(), "Source changed");
        hooks.invalid();

        // Coalesce bursts of saves into one rebuild
        tokio::time::sleep(debounce).await;
        while changes.try_recv().is_ok() {}

        let stats = build_all(&targets, &cwd).await;
        report(&hooks, &stats);
    }

    tracing::debug!("Build loop stopped");
}

fn report(hooks: &CompilerHooks, stats: &MultiStats) {
    if stats.has_errors() {
        tracing::warn!(duration_ms = stats.duration_ms, "Build finished with errors");
    } else {
        tracing::info!(duration_ms = stats.duration_ms, "Build finished");
    }

    match StatsData::from_serializable(stats) {
        Ok(data) => hooks.done(data),
        Err(e) => tracing::error!("Failed to serialize build stats: {}", e),
    }
}

async fn build_all(targets: &[BuildTarget], cwd: &Path) -> MultiStats {
    let start = Instant::now();
    let results = join_all(targets.iter().map(|t| build_target(t, cwd))).await;

    let mut hasher = blake3::Hasher::new();
    for (target, (stats, stdout)) in targets.iter().zip(&results) {
        hasher.update(target.name.as_bytes());
        hasher.update(&stats.exit_code.unwrap_or(-1).to_le_bytes());
        hasher.update(stdout);
    }

    MultiStats {
        hash: hasher.finalize().to_hex()[..16].to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        targets: results.into_iter().map(|(stats, _)| stats).collect(),
    }
}

async fn build_target(target: &BuildTarget, cwd: &Path) -> (TargetStats, Vec<u8>) {
    let start = Instant::now();
    let finish = |success: bool, exit_code: Option<i32>, stderr: String| TargetStats {
        name: target.name.clone(),
        success,
        exit_code,
        duration_ms: start.elapsed().as_millis() as u64,
        stderr,
    };

    let Some((program, args)) = target.command.split_first() else {
        tracing::debug!(target = %target.name, "No build command; nothing to run");
        return (finish(true, Some(0), String::new()), Vec::new());
    };

    tracing::debug!(target = %target.name, command = ?target.command, "Building target");

    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .envs(&target.env)
        .env("LIFTOFF_TARGET", &target.name)
        .env("LIFTOFF_OUT_DIR", &target.out_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(output) => {
            let stderr = tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL);
            (
                finish(output.status.success(), output.status.code(), stderr),
                output.stdout,
            )
        }
        Err(e) => {
            tracing::error!(target = %target.name, "Failed to spawn build command: {}", e);
            (
                finish(false, None, format!("failed to spawn `{program}`: {e}")),
                Vec::new(),
            )
        }
    }
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
