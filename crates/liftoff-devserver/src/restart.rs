//! Restart alarm: watches configuration files whose changes require a new session.
//!
//! Editors touch files without changing them and write files in several steps, so the
//! watcher compares blake3 content fingerprints instead of trusting raw events. Only
//! files whose content really changed are reported.
//!
//! The directory containing each file is watched (not the file itself) so atomic
//! rename-based writes are seen too.

use crate::channel::{BroadcastCell, ChannelReader};
use crate::error::{DevServerError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Restart signals: each non-empty value lists the files that changed.
pub type RestartAlarm = ChannelReader<Vec<String>>;

type Fingerprints = HashMap<PathBuf, Option<blake3::Hash>>;

/// Watches files and raises the restart alarm when their content changes.
pub struct RestartWatcher {
    _watcher: RecommendedWatcher,
    alarm: BroadcastCell<Vec<String>>,
    cancel: CancellationToken,
    files: Vec<PathBuf>,
}

impl RestartWatcher {
    /// Start watching `files`. Files that don't exist yet are watched for creation.
    ///
    /// Must be called from inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if a file's directory doesn't exist, the OS watcher cannot be
    /// created, or no runtime is available.
    pub fn new(files: Vec<PathBuf>, debounce_ms: u64) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DevServerError::Io(std::io::Error::other(e)))?;

        let files: Vec<PathBuf> = files.into_iter().map(normalize).collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_content_event(&event) => {
                for path in event.paths {
                    // Receiver gone means the watcher is shutting down
                    let _ = tx.send(path);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Restart watcher error: {}", e),
        })?;

        let dirs: BTreeSet<&Path> = files
            .iter()
            .map(|f| f.parent().unwrap_or(f.as_path()))
            .collect();
        for dir in dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }

        let fingerprints = fingerprint_all(&files);
        let alarm = BroadcastCell::new("restart-alarm", Vec::new());
        let cancel = CancellationToken::new();

        runtime.spawn(watch_loop(
            rx,
            fingerprints,
            alarm.clone(),
            Duration::from_millis(debounce_ms),
            cancel.clone(),
        ));

        tracing::debug!(files = ?files, "Restart watcher started");

        Ok(Self {
            _watcher: watcher,
            alarm,
            cancel,
            files,
        })
    }

    /// Restart signals.
    pub fn alarm(&self) -> RestartAlarm {
        self.alarm.reader()
    }

    /// Files being watched, as absolute paths.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Stop watching and complete alarm subscribers. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        self.alarm.close();
    }
}

impl Drop for RestartWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Absolute path with a canonical directory, matching the paths notify reports.
fn normalize(file: PathBuf) -> PathBuf {
    let absolute = std::path::absolute(&file).unwrap_or(file);
    let canonical_dir = absolute.parent().and_then(|dir| dir.canonicalize().ok());
    match (canonical_dir, absolute.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => absolute,
    }
}

fn is_content_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn fingerprint(path: &Path) -> Option<blake3::Hash> {
    std::fs::read(path).ok().map(|content| blake3::hash(&content))
}

fn fingerprint_all(files: &[PathBuf]) -> Fingerprints {
    files.iter().map(|f| (f.clone(), fingerprint(f))).collect()
}

/// Update `known` from disk and return the files whose content changed, sorted.
fn refresh(known: &mut Fingerprints) -> Vec<String> {
    let mut changed = Vec::new();
    for (path, hash) in known.iter_mut() {
        let current = fingerprint(path);
        if current != *hash {
            *hash = current;
            changed.push(path.display().to_string());
        }
    }
    changed.sort();
    changed
}

async fn watch_loop(
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    mut known: Fingerprints,
    alarm: BroadcastCell<Vec<String>>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => break,
            path = events.recv() => match path {
                Some(path) => path,
                None => break,
            },
        };
        if !known.contains_key(&path) {
            continue;
        }

        // Let multi-step writes settle
        tokio::time::sleep(debounce).await;
        while events.try_recv().is_ok() {}

        let changed = refresh(&mut known);
        if changed.is_empty() {
            tracing::trace!(path = %path.display(), "Touched without content change");
            continue;
        }

        tracing::info!(files = ?changed, "Configuration changed; restart required");
        if !alarm.publish(changed) {
            break;
        }
    }
}
