//! `liftoff dev`: run dev sessions until the user quits.
//!
//! Each session builds every target and serves them. When a restart file changes, the
//! session is closed, the configuration is reloaded, and a new session starts. Ctrl+C
//! (or the UI's quit key) closes the session and exits.

use crate::cli::DevArgs;
use crate::config::{LiftoffConfig, LoadedConfig};
use crate::error::{CliError, Result};
use crate::ui::{self, ConsoleUi};
use liftoff_devserver::watcher::DEFAULT_IGNORE;
use liftoff_devserver::{
    CommandCompiler, DevServerStatus, DevSession, RestartAlarm, RestartWatcher, SessionOptions,
    SessionParams, SessionUi, start_session,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Execute the dev command.
///
/// # Errors
///
/// Returns errors for invalid configuration, start failures (such as a port already in
/// use), and a final teardown that did not complete cleanly.
pub async fn execute(args: DevArgs) -> Result<()> {
    let cwd = resolve_cwd(args.cwd.as_deref())?;
    let console_ui: Option<Arc<dyn SessionUi>> = if is_interactive(&args) {
        Some(Arc::new(ConsoleUi::new()))
    } else {
        None
    };

    let sessions = DevRunner::new(args, cwd, console_ui).run(ctrl_c()).await?;
    tracing::debug!(sessions, "Dev command finished");
    ui::success("Development server stopped");
    Ok(())
}

/// Interactive output needs a person at the terminal and no opt-out.
fn is_interactive(args: &DevArgs) -> bool {
    !args.no_interactive
        && !ui::is_ci()
        && console::user_attended()
        && console::user_attended_stderr()
}

fn resolve_cwd(cwd: Option<&Path>) -> Result<PathBuf> {
    let current = std::env::current_dir()?;
    let cwd = match cwd {
        Some(dir) => current.join(dir),
        None => current,
    };
    if !cwd.is_dir() {
        return Err(CliError::FileNotFound(cwd));
    }
    Ok(cwd)
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}

/// Why a session ended.
#[derive(Debug, PartialEq)]
enum Outcome {
    Quit,
    Restart(Vec<String>),
}

type SessionCallback = Box<dyn Fn(&DevSession) + Send + Sync>;

/// The restart loop behind `liftoff dev`.
pub struct DevRunner {
    args: DevArgs,
    cwd: PathBuf,
    ui: Option<Arc<dyn SessionUi>>,
    on_session: Option<SessionCallback>,
}

impl DevRunner {
    /// Runner loading configuration for `args` from `cwd`. With `ui`, sessions are
    /// interactive.
    pub fn new(args: DevArgs, cwd: PathBuf, ui: Option<Arc<dyn SessionUi>>) -> Self {
        Self {
            args,
            cwd,
            ui,
            on_session: None,
        }
    }

    /// Call `callback` every time a session is up.
    pub fn on_session_started(
        mut self,
        callback: impl Fn(&DevSession) + Send + Sync + 'static,
    ) -> Self {
        self.on_session = Some(Box::new(callback));
        self
    }

    /// Run sessions until `shutdown` resolves or the session is closed from the UI.
    ///
    /// Returns how many sessions were started.
    ///
    /// # Errors
    ///
    /// Returns the first configuration or start error, or the final teardown error.
    /// Configuration errors after a restart keep the previous configuration instead.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<usize> {
        tokio::pin!(shutdown);
        let mut loaded = LiftoffConfig::load(&self.args, &self.cwd)?;
        let mut sessions = 0;

        loop {
            let restart = RestartWatcher::new(
                watchable(&loaded.config.restart_on),
                loaded.config.debounce_ms,
            )?;
            let session = start_session(self.params(&loaded, restart.alarm())).await?;
            sessions += 1;

            if self.ui.is_none() {
                ui::success(&format!("Dev server running at {}", session.url()));
                ui::info("Press Ctrl+C to stop");
            }
            if let Some(callback) = &self.on_session {
                callback(&session);
            }

            let outcome = wait_for_outcome(&session, restart.alarm(), &mut shutdown).await;
            restart.close();
            let closed = session.close().await;

            match outcome {
                Outcome::Quit => {
                    closed?;
                    return Ok(sessions);
                }
                Outcome::Restart(files) => {
                    if let Err(e) = closed {
                        ui::warning(&format!("Previous session did not stop cleanly: {e}"));
                    }
                    if self.ui.is_none() {
                        ui::info(&format!("Restarting: {} changed", files.join(", ")));
                    }
                    match LiftoffConfig::load(&self.args, &self.cwd) {
                        Ok(next) => loaded = next,
                        Err(e) => ui::error(&format!("Keeping previous configuration: {e}")),
                    }
                }
            }
        }
    }

    fn params(&self, loaded: &LoadedConfig, alarm: RestartAlarm) -> SessionParams {
        let config = &loaded.config;

        let mut ignore: Vec<String> = DEFAULT_IGNORE.iter().map(|p| p.to_string()).collect();
        ignore.extend(config.watch_ignore.iter().cloned());
        let compiler = CommandCompiler::new(self.cwd.clone())
            .with_ignore_patterns(ignore)
            .with_debounce_ms(config.debounce_ms);

        SessionParams::new(
            config.targets.clone(),
            config.server.clone(),
            Arc::new(compiler),
        )
        .with_options(SessionOptions {
            interactive: self.ui.is_some(),
            ui: self.ui.clone(),
            restart_alarm: Some(alarm),
            log_file: self.args.log_file.clone(),
            on_exit: None,
            proxy_log_capacity: config.proxy_log_capacity,
        })
    }
}

/// Restart files whose directory exists; others cannot be watched.
fn watchable(files: &[PathBuf]) -> Vec<PathBuf> {
    files
        .iter()
        .filter(|file| {
            let ok = file.parent().is_some_and(Path::is_dir);
            if !ok {
                tracing::debug!(file = %file.display(), "Not watching restart file");
            }
            ok
        })
        .cloned()
        .collect()
}

async fn wait_for_outcome<F: Future<Output = ()>>(
    session: &DevSession,
    alarm: RestartAlarm,
    shutdown: &mut Pin<&mut F>,
) -> Outcome {
    let mut alarm = alarm.stream();
    let mut status = session.status().stream();

    loop {
        tokio::select! {
            _ = shutdown.as_mut() => return Outcome::Quit,
            changed = alarm.recv() => match changed {
                Some(files) if !files.is_empty() => return Outcome::Restart(files),
                Some(_) => {}
                None => return Outcome::Quit,
            },
            status = status.recv() => match status {
                Some(DevServerStatus::Closing | DevServerStatus::Closed) | None => {
                    return Outcome::Quit;
                }
                Some(_) => {}
            },
        }
    }
}
