//! Configuration for `liftoff dev`, merged from several sources.
//!
//! Priority: CLI flags > `LIFTOFF_` environment variables > config file > defaults.
//! Nested keys use a double underscore in the environment (`LIFTOFF_SERVER__PORT=4000`).
//!
//! ```toml
//! restart_on = ["package.json", "tsconfig.json"]
//!
//! [server]
//! port = 3000
//!
//! [server.proxy]
//! "/api" = "http://localhost:9999"
//!
//! [[targets]]
//! name = "main"
//! outDir = "dist/main"
//! platform = "electron-main"
//! command = ["npm", "run", "build:main"]
//! watch = ["src/main"]
//! ```

use crate::cli::DevArgs;
use crate::error::{ConfigError, Result};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
};
use liftoff_devserver::proxy::DEFAULT_CAPACITY;
use liftoff_devserver::{BuildTargets, ServerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Files looked up in the working directory when `--config` is not given.
pub const CONFIG_FILES: &[&str] = &["liftoff.toml", "liftoff.json", "liftoff.yaml"];

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "LIFTOFF_";

/// Configuration of a dev session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftoffConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// One target table or an array of them
    #[serde(default)]
    pub targets: BuildTargets,

    /// Files whose content changes restart the whole session
    #[serde(default = "default_restart_on")]
    pub restart_on: Vec<PathBuf>,

    /// Extra watcher ignore patterns, added to the built-in ones
    #[serde(default)]
    pub watch_ignore: Vec<String>,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Proxy records kept for the UI
    #[serde(default = "default_proxy_log_capacity")]
    pub proxy_log_capacity: usize,
}

fn default_restart_on() -> Vec<PathBuf> {
    vec![PathBuf::from("package.json"), PathBuf::from("tsconfig.json")]
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_proxy_log_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for LiftoffConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            targets: BuildTargets::default(),
            restart_on: default_restart_on(),
            watch_ignore: Vec::new(),
            debounce_ms: default_debounce_ms(),
            proxy_log_capacity: default_proxy_log_capacity(),
        }
    }
}

/// Flags that override file and environment settings. Unset flags are omitted.
#[derive(Debug, Default, Serialize)]
struct CliOverrides {
    server: ServerOverrides,
}

#[derive(Debug, Default, Serialize)]
struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

/// A loaded configuration and the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: LiftoffConfig,
    pub source: Option<PathBuf>,
}

impl LiftoffConfig {
    /// Load, resolve relative paths against `cwd`, and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an explicit config file is missing, a source
    /// cannot be parsed, or validation fails.
    pub fn load(args: &DevArgs, cwd: &Path) -> Result<LoadedConfig> {
        let source = find_config_file(args.config.as_deref(), cwd)?;

        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = &source {
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let overrides = CliOverrides {
            server: ServerOverrides {
                host: args.host.clone(),
                port: args.port,
            },
        };
        figment = figment.merge(Serialized::defaults(overrides));

        let mut config: Self = figment
            .extract()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        config.resolve_paths(cwd);
        if let Some(path) = &source {
            if !config.restart_on.contains(path) {
                config.restart_on.push(path.clone());
            }
        }
        config.validate()?;

        tracing::debug!(source = ?source, targets = ?config.targets.names(), "Configuration loaded");
        Ok(LoadedConfig { config, source })
    }

    /// Make every relative path absolute against `cwd`.
    pub fn resolve_paths(&mut self, cwd: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = cwd.join(&*path);
            }
        };

        let mut targets = std::mem::take(&mut self.targets).into_vec();
        for target in &mut targets {
            resolve(&mut target.out_dir);
            target.watch.iter_mut().for_each(resolve);
        }
        self.targets = targets.into();

        self.server.static_dirs.iter_mut().for_each(resolve);
        if let Some(https) = &mut self.server.https {
            resolve(&mut https.cert);
            resolve(&mut https.key);
        }
        self.restart_on.iter_mut().for_each(resolve);
    }

    /// Check the configuration for mistakes the session would only report late.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::MissingField {
                field: "targets".to_string(),
                hint: "Add at least one [[targets]] table with a name and outDir".to_string(),
            });
        }

        let mut names = HashSet::new();
        for target in self.targets.as_slice() {
            if target.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "targets.name".to_string(),
                    value: format!("{:?}", target.name),
                    hint: "Every target needs a non-empty name".to_string(),
                });
            }
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "targets.name".to_string(),
                    value: target.name.clone(),
                    hint: "Target names must be unique".to_string(),
                });
            }
        }

        if self.server.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "server.host".to_string(),
                value: String::new(),
                hint: "Use localhost, 127.0.0.1, or 0.0.0.0".to_string(),
            });
        }

        if let Some(https) = &self.server.https {
            https.validate().map_err(|e| ConfigError::InvalidValue {
                field: "server.https".to_string(),
                value: e.to_string(),
                hint: "Point cert and key at existing PEM files".to_string(),
            })?;
        }

        if let Some(proxy) = &self.server.proxy {
            for rule in proxy.rules() {
                if let Some(context) = rule.context.iter().find(|c| !c.starts_with('/')) {
                    return Err(ConfigError::InvalidValue {
                        field: "server.proxy".to_string(),
                        value: context.clone(),
                        hint: "Proxy contexts are path prefixes starting with '/'".to_string(),
                    });
                }
                let target = &rule.options.target;
                if !(target.starts_with("http://") || target.starts_with("https://")) {
                    return Err(ConfigError::InvalidValue {
                        field: "server.proxy".to_string(),
                        value: target.clone(),
                        hint: "Proxy targets must be http:// or https:// URLs".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// The explicit config file, or the first default file present in `cwd`.
fn find_config_file(explicit: Option<&Path>, cwd: &Path) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        let path = if path.is_relative() {
            cwd.join(path)
        } else {
            path.to_path_buf()
        };
        if !path.is_file() {
            return Err(ConfigError::NotFound(path).into());
        }
        return Ok(Some(path));
    }

    Ok(CONFIG_FILES
        .iter()
        .map(|name| cwd.join(name))
        .find(|path| path.is_file()))
}
