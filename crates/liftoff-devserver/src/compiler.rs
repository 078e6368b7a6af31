//! Compiler boundary: build targets, the multi-target `Compiler` trait, and the hook
//! handle compilers use to report progress.

use crate::channel::BroadcastCell;
use crate::error::Result;
use crate::status::{BuildStats, StatsData};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Runtime environment a target is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetPlatform {
    /// Browser bundle
    #[default]
    Web,
    /// Electron main process
    ElectronMain,
    /// Electron preload / renderer process
    ElectronRenderer,
    /// Plain Node.js
    Node,
}

/// One compilation target.
///
/// The session treats targets as opaque; only the compiler reads the fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTarget {
    /// Unique name used in logs and stats (e.g. "main", "renderer")
    pub name: String,

    /// Entry points, keyed by chunk name
    #[serde(default)]
    pub entry: BTreeMap<String, String>,

    /// Output directory for this target
    pub out_dir: PathBuf,

    /// Target environment
    #[serde(default)]
    pub platform: TargetPlatform,

    /// Build command (argv) used by `CommandCompiler`
    #[serde(default)]
    pub command: Vec<String>,

    /// Paths whose changes invalidate this target
    #[serde(default)]
    pub watch: Vec<PathBuf>,

    /// Extra environment passed to the build command
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl BuildTarget {
    /// Create a target with just a name and output directory.
    pub fn new(name: impl Into<String>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            entry: BTreeMap::new(),
            out_dir: out_dir.into(),
            platform: TargetPlatform::default(),
            command: Vec::new(),
            watch: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Add an entry point.
    pub fn with_entry(mut self, chunk: impl Into<String>, path: impl Into<String>) -> Self {
        self.entry.insert(chunk.into(), path.into());
        self
    }

    /// Set the target platform.
    pub fn with_platform(mut self, platform: TargetPlatform) -> Self {
        self.platform = platform;
        self
    }

    /// Set the build command.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Add a watched path.
    pub fn with_watch(mut self, path: impl Into<PathBuf>) -> Self {
        self.watch.push(path.into());
        self
    }
}

/// Normalized sequence of build targets.
///
/// Accepts a single target or a sequence uniformly, both in code (`From`) and in
/// configuration files (a single table or an array).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BuildTargets(Vec<BuildTarget>);

impl BuildTargets {
    /// Targets in declaration order.
    pub fn as_slice(&self) -> &[BuildTarget] {
        &self.0
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no targets.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume into the underlying vector.
    pub fn into_vec(self) -> Vec<BuildTarget> {
        self.0
    }

    /// Target names, in order.
    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|t| t.name.as_str()).collect()
    }
}

impl From<BuildTarget> for BuildTargets {
    fn from(target: BuildTarget) -> Self {
        Self(vec![target])
    }
}

impl From<Vec<BuildTarget>> for BuildTargets {
    fn from(targets: Vec<BuildTarget>) -> Self {
        Self(targets)
    }
}

impl FromIterator<BuildTarget> for BuildTargets {
    fn from_iter<I: IntoIterator<Item = BuildTarget>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'de> Deserialize<'de> for BuildTargets {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(Box<BuildTarget>),
            Many(Vec<BuildTarget>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(target) => Self(vec![*target]),
            OneOrMany::Many(targets) => Self(targets),
        })
    }
}

/// Handle a compiler uses to report its lifecycle to the session.
///
/// Publishes after the session closed its stats channel are silently dropped.
#[derive(Clone)]
pub struct CompilerHooks {
    stats: BroadcastCell<BuildStats>,
}

impl CompilerHooks {
    pub(crate) fn new(stats: BroadcastCell<BuildStats>) -> Self {
        Self { stats }
    }

    /// Sources changed; a new compile is pending.
    pub fn invalid(&self) {
        self.stats.publish(BuildStats::Invalid);
    }

    /// A compile finished.
    pub fn done(&self, stats: StatsData) {
        self.stats.publish(BuildStats::Done { stats });
    }

    /// Whether the session stopped listening for compiler events.
    pub fn is_closed(&self) -> bool {
        self.stats.is_closed()
    }
}

impl std::fmt::Debug for CompilerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerHooks")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Multi-target compiler driven by a session.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Start compiling and watching `targets`, reporting through `hooks`.
    ///
    /// Must return once watching is set up; builds continue in the background.
    async fn watch(&self, targets: BuildTargets, hooks: CompilerHooks) -> Result<()>;

    /// Stop watching and release every resource `watch` acquired.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_target_normalizes_to_sequence() {
        let targets: BuildTargets = BuildTarget::new("web", "dist").into();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets.names(), vec!["web"]);
    }

    #[test]
    fn test_deserialize_single_table() {
        let json = r#"{ "name": "renderer", "outDir": "out", "platform": "electron-renderer" }"#;
        let targets: BuildTargets = serde_json::from_str(json).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets.as_slice()[0].platform, TargetPlatform::ElectronRenderer);
    }

    #[test]
    fn test_deserialize_array() {
        let json = r#"[
            { "name": "main", "outDir": "out", "platform": "electron-main",
              "entry": { "main": "src/app/main.ts", "preload": "src/app/preload.ts" } },
            { "name": "renderer", "outDir": "out", "command": ["esbuild", "src/app/renderer.tsx"] }
        ]"#;
        let targets: BuildTargets = serde_json::from_str(json).unwrap();
        assert_eq!(targets.names(), vec!["main", "renderer"]);
        assert_eq!(targets.as_slice()[0].entry.len(), 2);
        assert_eq!(targets.as_slice()[1].command[0], "esbuild");
        assert_eq!(targets.as_slice()[1].platform, TargetPlatform::Web);
    }

    #[test]
    fn test_hooks_publish_into_stats_channel() {
        let cell = BroadcastCell::new("stats", BuildStats::Waiting);
        let hooks = CompilerHooks::new(cell.clone());

        hooks.invalid();
        assert!(cell.get().is_invalid());

        hooks.done(StatsData::new(serde_json::json!({ "ok": true })));
        assert!(cell.get().is_done());

        cell.close();
        assert!(hooks.is_closed());
        hooks.invalid();
        assert!(cell.get().is_done());
    }
}
