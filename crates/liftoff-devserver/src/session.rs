//! Compiler session: one compiler plus one dev server driven through
//! `Starting → Started → Closing → Closed`.
//!
//! The session owns the status and stats channels and the two waiter sets. Status is
//! only ever advanced along the legal edge with a compare-and-publish on the status
//! cell, so `close()` can be called any number of times from any thread and only the
//! first call after the server started has an effect.

use crate::channel::{BroadcastCell, ChannelReader};
use crate::compiler::{BuildTargets, Compiler, CompilerHooks};
use crate::error::{DevServerError, Result};
use crate::server::{ServerBackend, ServerContext};
use crate::status::{BuildStats, DevServerStatus};
use crate::waiters::WaiterSet;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;

struct SessionInner {
    targets: BuildTargets,
    compiler: Arc<dyn Compiler>,
    server: Arc<dyn ServerBackend>,
    status: BroadcastCell<DevServerStatus>,
    stats: BroadcastCell<BuildStats>,
    start_waiters: WaiterSet,
    close_waiters: WaiterSet,
    start_called: AtomicBool,
    runtime: OnceLock<Handle>,
    local_addr: OnceLock<SocketAddr>,
    stop_errors: Mutex<Vec<DevServerError>>,
}

/// A multi-target compiler and a dev server sharing one lifecycle.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct CompilerSession {
    inner: Arc<SessionInner>,
}

impl CompilerSession {
    /// Create a session in `Starting`. Nothing runs until [`start`](Self::start).
    pub fn new(
        targets: impl Into<BuildTargets>,
        compiler: Arc<dyn Compiler>,
        server: Arc<dyn ServerBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                targets: targets.into(),
                compiler,
                server,
                status: BroadcastCell::new("status", DevServerStatus::Starting),
                stats: BroadcastCell::new("stats", BuildStats::Waiting),
                start_waiters: WaiterSet::new(),
                close_waiters: WaiterSet::new(),
                start_called: AtomicBool::new(false),
                runtime: OnceLock::new(),
                local_addr: OnceLock::new(),
                stop_errors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the compiler, then the server.
    ///
    /// Once the server is listening, status becomes `Started` and every pending
    /// [`wait_until_start`](Self::wait_until_start) resolves.
    ///
    /// # Errors
    ///
    /// Compiler and bind failures are returned as-is. The session is then terminal:
    /// the compiler is closed, both channels complete, and start waiters fail with
    /// [`DevServerError::StartAborted`]. A session can only be started once.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.inner.start_called.swap(true, Ordering::SeqCst) {
            return Err(DevServerError::AlreadyStarted);
        }
        let _ = self.inner.runtime.set(Handle::current());

        tracing::debug!(targets = ?self.inner.targets.names(), "Starting compiler session");

        match self.bring_up().await {
            Ok(addr) => {
                let _ = self.inner.local_addr.set(addr);
                self.advance(DevServerStatus::Starting, DevServerStatus::Started);
                self.inner.start_waiters.fire();
                Ok(addr)
            }
            Err(e) => {
                tracing::debug!("Session start failed: {e}");
                if let Err(close_err) = self.inner.compiler.close().await {
                    tracing::warn!("Failed to close compiler after failed start: {close_err}");
                }
                self.inner.stats.close();
                self.inner.status.close();
                self.inner.start_waiters.abandon();
                self.inner.close_waiters.fire();
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<SocketAddr> {
        let inner = &self.inner;
        let hooks = CompilerHooks::new(inner.stats.clone());
        inner.compiler.watch(inner.targets.clone(), hooks).await?;

        let ctx = ServerContext {
            stats: inner.stats.reader(),
            out_dirs: inner
                .targets
                .as_slice()
                .iter()
                .map(|t| t.out_dir.clone())
                .collect(),
        };
        inner.server.listen(ctx).await
    }

    /// Resolve once status is at least `Started`.
    ///
    /// # Errors
    ///
    /// Returns [`DevServerError::StartAborted`] if the start failed.
    pub async fn wait_until_start(&self) -> Result<()> {
        if self.current_status() >= DevServerStatus::Started {
            return Ok(());
        }
        self.inner
            .start_waiters
            .wait()
            .await
            .map_err(|_| DevServerError::StartAborted)
    }

    /// Begin closing.
    ///
    /// Only acts when status is exactly `Started`: publishes `Closing` and stops the
    /// server and compiler in the background. Returns whether this call started the
    /// close. Calls in any other state are ignored, including calls made while the
    /// session is still `Starting`; await [`wait_until_start`](Self::wait_until_start)
    /// first when a close must not be lost.
    pub fn close(&self) -> bool {
        let Some(runtime) = self.inner.runtime.get().cloned() else {
            tracing::debug!("close() ignored: session never started");
            return false;
        };
        if !self.advance(DevServerStatus::Started, DevServerStatus::Closing) {
            tracing::debug!(status = %self.current_status(), "close() ignored");
            return false;
        }

        let session = self.clone();
        runtime.spawn(async move { session.finish_close().await });
        true
    }

    async fn finish_close(&self) {
        let inner = Arc::clone(&self.inner);
        let stop = AssertUnwindSafe(async move {
            let mut errors = Vec::new();
            if let Err(e) = inner.server.stop().await {
                tracing::warn!("Dev server stop failed: {e}");
                errors.push(e);
            }
            if let Err(e) = inner.compiler.close().await {
                tracing::warn!("Compiler close failed: {e}");
                errors.push(e);
            }
            errors
        })
        .catch_unwind()
        .await;

        let errors = stop.unwrap_or_else(|_| {
            vec![DevServerError::StopFailed(
                "stop operation panicked".to_string(),
            )]
        });
        self.inner.stop_errors.lock().extend(errors);

        // Stats complete before CLOSED so nothing reacting to CLOSED sees another build event.
        // Waiters may resume on another worker at once, so they fire only after CLOSED.
        self.inner.stats.close();
        self.advance(DevServerStatus::Closing, DevServerStatus::Closed);
        self.inner.status.close();
        self.inner.close_waiters.fire();

        tracing::debug!("Compiler session closed");
    }

    /// Resolve once status is `Closed`, or immediately if the session is already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`DevServerError::SessionDropped`] if the session went away first.
    pub async fn wait_until_close(&self) -> Result<()> {
        if self.current_status() >= DevServerStatus::Closed || self.inner.status.is_closed() {
            return Ok(());
        }
        self.inner
            .close_waiters
            .wait()
            .await
            .map_err(|_| DevServerError::SessionDropped(DevServerStatus::Closed))
    }

    /// Take the failures recorded while stopping the server and compiler.
    pub fn take_stop_errors(&self) -> Vec<DevServerError> {
        std::mem::take(&mut *self.inner.stop_errors.lock())
    }

    /// Move status along `from → to`. Returns `false` if status was not `from`.
    fn advance(&self, from: DevServerStatus, to: DevServerStatus) -> bool {
        debug_assert!(from.can_transition_to(to));
        let advanced = self.inner.status.publish_if(|current| *current == from, to);
        if advanced {
            tracing::debug!(%from, %to, "Session status");
        }
        advanced
    }

    /// Status channel.
    pub fn status(&self) -> ChannelReader<DevServerStatus> {
        self.inner.status.reader()
    }

    /// Build stats channel.
    pub fn stats(&self) -> ChannelReader<BuildStats> {
        self.inner.stats.reader()
    }

    pub fn current_status(&self) -> DevServerStatus {
        self.inner.status.get()
    }

    /// Address the server bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub fn targets(&self) -> &BuildTargets {
        &self.inner.targets
    }
}

impl fmt::Debug for CompilerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerSession")
            .field("targets", &self.inner.targets.names())
            .field("status", &self.current_status())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}
