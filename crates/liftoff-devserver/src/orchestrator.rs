//! Session orchestration: build a session from configuration, wire the proxy log and
//! the UI, wait for the server, and hand back one idempotent close handle.

use crate::channel::ChannelReader;
use crate::compiler::{BuildTargets, Compiler};
use crate::error::{DevServerError, Result, TeardownError};
use crate::proxy::{DEFAULT_CAPACITY, ProxyEventLog, ProxyLogRecord};
use crate::server::{AxumServerFactory, ServerConfig, ServerFactory};
use crate::session::CompilerSession;
use crate::status::{BuildStats, DevServerStatus};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Callback the UI invokes when the user asks to quit.
pub type ExitCallback = Arc<dyn Fn() + Send + Sync>;

/// Everything the interactive UI gets to render.
#[derive(Clone)]
pub struct UiFeeds {
    pub status: ChannelReader<DevServerStatus>,
    pub stats: ChannelReader<BuildStats>,
    /// Present only when proxying is configured
    pub proxy_log: Option<ChannelReader<Vec<ProxyLogRecord>>>,
    pub restart_alarm: Option<ChannelReader<Vec<String>>>,
    pub url: String,
    /// Where console output is redirected while the UI owns the terminal
    pub log_file: Option<PathBuf>,
    pub exit: ExitCallback,
}

/// Interactive presentation of a running session.
pub trait SessionUi: Send + Sync {
    fn mount(&self, feeds: UiFeeds) -> Result<Box<dyn UiHandle>>;
}

/// A mounted UI.
pub trait UiHandle: Send {
    fn unmount(self: Box<Self>) -> Result<()>;
}

/// Caller-level switches for [`start_session`].
#[derive(Clone)]
pub struct SessionOptions {
    /// Mount `ui`. Decided by the caller, never inferred here.
    pub interactive: bool,
    pub ui: Option<Arc<dyn SessionUi>>,
    /// Restart signals, forwarded to the UI only
    pub restart_alarm: Option<ChannelReader<Vec<String>>>,
    pub log_file: Option<PathBuf>,
    /// Called when the UI requests exit; defaults to closing the session
    pub on_exit: Option<ExitCallback>,
    pub proxy_log_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            interactive: false,
            ui: None,
            restart_alarm: None,
            log_file: None,
            on_exit: None,
            proxy_log_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("interactive", &self.interactive)
            .field("ui", &self.ui.is_some())
            .field("restart_alarm", &self.restart_alarm.is_some())
            .field("log_file", &self.log_file)
            .field("on_exit", &self.on_exit.is_some())
            .field("proxy_log_capacity", &self.proxy_log_capacity)
            .finish()
    }
}

/// Inputs of [`start_session`].
pub struct SessionParams {
    pub targets: BuildTargets,
    pub server: ServerConfig,
    pub compiler: Arc<dyn Compiler>,
    /// Defaults to [`AxumServerFactory`]
    pub server_factory: Option<Arc<dyn ServerFactory>>,
    pub options: SessionOptions,
}

impl SessionParams {
    pub fn new(
        targets: impl Into<BuildTargets>,
        server: ServerConfig,
        compiler: Arc<dyn Compiler>,
    ) -> Self {
        Self {
            targets: targets.into(),
            server,
            compiler,
            server_factory: None,
            options: SessionOptions::default(),
        }
    }

    pub fn with_server_factory(mut self, factory: Arc<dyn ServerFactory>) -> Self {
        self.server_factory = Some(factory);
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }
}

/// Start a session and wait until its server is listening.
///
/// When the server config has a proxy, it is wrapped by a [`ProxyEventLog`] before the
/// server is built; forwarding is unchanged. The UI is mounted only when
/// `options.interactive` is set and a UI was supplied.
///
/// # Errors
///
/// Returns [`DevServerError::NoTargets`] for an empty target list and propagates any
/// server construction, compiler, bind, or UI mount failure. Nothing is left running
/// when this fails.
pub async fn start_session(params: SessionParams) -> Result<DevSession> {
    let SessionParams {
        targets,
        server: mut server_config,
        compiler,
        server_factory,
        options,
    } = params;

    if targets.is_empty() {
        return Err(DevServerError::NoTargets);
    }

    let proxy_log = match &server_config.proxy {
        Some(proxy) => {
            let log = ProxyEventLog::new(options.proxy_log_capacity);
            let wrapped = log.wrap(proxy);
            server_config.proxy = Some(wrapped);
            Some(log)
        }
        None => None,
    };
    let discard_log = || {
        if let Some(log) = &proxy_log {
            log.close();
        }
    };

    let factory = server_factory.unwrap_or_else(|| Arc::new(AxumServerFactory));
    let server = match factory.create(server_config.clone()) {
        Ok(server) => server,
        Err(e) => {
            discard_log();
            return Err(e);
        }
    };

    let session = CompilerSession::new(targets, compiler, server);
    let addr = match session.start().await {
        Ok(addr) => addr,
        Err(e) => {
            discard_log();
            return Err(e);
        }
    };
    let url = server_config.url_for(addr);
    let close_handle = CloseHandle::new(session.clone(), proxy_log.clone());

    if options.interactive {
        if let Some(ui) = &options.ui {
            let feeds = UiFeeds {
                status: session.status(),
                stats: session.stats(),
                proxy_log: proxy_log.as_ref().map(ProxyEventLog::records),
                restart_alarm: options.restart_alarm.clone(),
                url: url.clone(),
                log_file: options.log_file.clone(),
                exit: options
                    .on_exit
                    .clone()
                    .unwrap_or_else(|| close_on_exit(&close_handle)),
            };

            match ui.mount(feeds) {
                Ok(handle) => close_handle.attach_ui(handle),
                Err(e) => {
                    if let Err(close_err) = close_handle.close().await {
                        tracing::warn!("Teardown after failed UI mount: {close_err}");
                    }
                    return Err(e);
                }
            }
        }
    }

    session.wait_until_start().await?;
    tracing::info!(%url, "Dev server ready");

    Ok(DevSession {
        session,
        url,
        local_addr: addr,
        proxy_log,
        close_handle,
    })
}

fn close_on_exit(handle: &CloseHandle) -> ExitCallback {
    let handle = handle.clone();
    let runtime = tokio::runtime::Handle::current();
    Arc::new(move || {
        let handle = handle.clone();
        runtime.spawn(async move {
            if let Err(e) = handle.close().await {
                tracing::warn!("{e}");
            }
        });
    })
}

struct CloseInner {
    session: CompilerSession,
    proxy_log: Option<ProxyEventLog>,
    ui: Mutex<Option<Box<dyn UiHandle>>>,
    done: OnceCell<()>,
}

/// Idempotent teardown of a whole session.
///
/// Clones share one teardown. Concurrent and repeated calls all wait for that single run;
/// only the call that performed it reports its errors.
#[derive(Clone)]
pub struct CloseHandle {
    inner: Arc<CloseInner>,
}

impl CloseHandle {
    fn new(session: CompilerSession, proxy_log: Option<ProxyEventLog>) -> Self {
        Self {
            inner: Arc::new(CloseInner {
                session,
                proxy_log,
                ui: Mutex::new(None),
                done: OnceCell::new(),
            }),
        }
    }

    fn attach_ui(&self, handle: Box<dyn UiHandle>) {
        *self.inner.ui.lock() = Some(handle);
    }

    /// Close the session, release the proxy log, and unmount the UI, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`DevServerError::Teardown`] listing stop and unmount failures. Every
    /// step still runs when an earlier one fails.
    pub async fn close(&self) -> Result<()> {
        let mut outcome = Ok(());
        let slot = &mut outcome;
        self.inner
            .done
            .get_or_init(|| async move {
                *slot = self.teardown().await;
            })
            .await;
        outcome
    }

    /// Whether teardown already finished.
    pub fn is_closed(&self) -> bool {
        self.inner.done.initialized()
    }

    async fn teardown(&self) -> Result<()> {
        let session = &self.inner.session;
        let mut errors = TeardownError::new();

        let closing = session.close();
        if closing || session.current_status() >= DevServerStatus::Closing {
            if let Err(e) = session.wait_until_close().await {
                errors.push(e);
            }
        } else {
            tracing::debug!(status = %session.current_status(), "Session was not running");
        }
        for e in session.take_stop_errors() {
            errors.push(e);
        }

        if let Some(log) = &self.inner.proxy_log {
            log.close();
        }

        let ui = self.inner.ui.lock().take();
        if let Some(ui) = ui {
            if let Err(e) = ui.unmount() {
                errors.push(e);
            }
        }

        tracing::info!("Dev session closed");
        errors.into_result().map_err(DevServerError::from)
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A running dev session.
#[derive(Debug)]
pub struct DevSession {
    session: CompilerSession,
    url: String,
    local_addr: SocketAddr,
    proxy_log: Option<ProxyEventLog>,
    close_handle: CloseHandle,
}

impl DevSession {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> ChannelReader<DevServerStatus> {
        self.session.status()
    }

    pub fn stats(&self) -> ChannelReader<BuildStats> {
        self.session.stats()
    }

    /// Proxy records, when proxying is configured.
    pub fn proxy_log(&self) -> Option<ChannelReader<Vec<ProxyLogRecord>>> {
        self.proxy_log.as_ref().map(ProxyEventLog::records)
    }

    pub fn session(&self) -> &CompilerSession {
        &self.session
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close_handle.clone()
    }

    /// Shorthand for `close_handle().close()`.
    pub async fn close(&self) -> Result<()> {
        self.close_handle.close().await
    }
}
