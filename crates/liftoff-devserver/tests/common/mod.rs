//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use liftoff_devserver::{
    AxumServerFactory, BuildTargets, Compiler, CompilerHooks, DevServerError, Result,
    ServerBackend, ServerConfig, ServerContext, ServerFactory, SessionUi, UiFeeds, UiHandle,
};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Fail the test if `f` takes longer than a few seconds.
pub async fn timed<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("operation timed out")
}

/// Compiler that only keeps its hooks so tests can emit build events.
#[derive(Default)]
pub struct ScriptedCompiler {
    pub hooks: Mutex<Option<CompilerHooks>>,
    pub watches: AtomicUsize,
    pub closes: AtomicUsize,
}

impl ScriptedCompiler {
    pub fn hooks(&self) -> CompilerHooks {
        self.hooks.lock().clone().expect("compiler is watching")
    }
}

#[async_trait]
impl Compiler for ScriptedCompiler {
    async fn watch(&self, _targets: BuildTargets, hooks: CompilerHooks) -> Result<()> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        *self.hooks.lock() = Some(hooks);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Real axum server whose `stop` reports a failure after stopping.
pub struct FailingStopServer {
    inner: Arc<dyn ServerBackend>,
    pub stops: AtomicUsize,
}

#[async_trait]
impl ServerBackend for FailingStopServer {
    async fn listen(&self, ctx: ServerContext) -> Result<SocketAddr> {
        self.inner.listen(ctx).await
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.inner.stop().await?;
        Err(DevServerError::StopFailed("simulated stop failure".to_string()))
    }
}

/// Factory producing [`FailingStopServer`]s and remembering the last one.
#[derive(Default)]
pub struct FailingStopFactory {
    pub last: Mutex<Option<Arc<FailingStopServer>>>,
}

impl FailingStopFactory {
    pub fn stops(&self) -> usize {
        self.last
            .lock()
            .as_ref()
            .map(|s| s.stops.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl ServerFactory for FailingStopFactory {
    fn create(&self, config: ServerConfig) -> Result<Arc<dyn ServerBackend>> {
        let server = Arc::new(FailingStopServer {
            inner: AxumServerFactory.create(config)?,
            stops: AtomicUsize::new(0),
        });
        *self.last.lock() = Some(Arc::clone(&server));
        Ok(server)
    }
}

/// UI recording what happened to it.
#[derive(Default)]
pub struct RecordingUi {
    pub events: Arc<Mutex<Vec<String>>>,
    pub feeds: Mutex<Option<UiFeeds>>,
    pub fail_mount: bool,
}

struct RecordingHandle {
    events: Arc<Mutex<Vec<String>>>,
}

impl SessionUi for RecordingUi {
    fn mount(&self, feeds: UiFeeds) -> Result<Box<dyn UiHandle>> {
        if self.fail_mount {
            return Err(DevServerError::Ui("no terminal".to_string()));
        }
        self.events.lock().push(format!("mount {}", feeds.url));
        *self.feeds.lock() = Some(feeds);
        Ok(Box::new(RecordingHandle {
            events: Arc::clone(&self.events),
        }))
    }
}

impl UiHandle for RecordingHandle {
    fn unmount(self: Box<Self>) -> Result<()> {
        self.events.lock().push("unmount".to_string());
        Ok(())
    }
}
