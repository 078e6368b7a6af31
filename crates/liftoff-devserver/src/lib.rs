//! Liftoff dev server - session lifecycle for multi-target front-end and Electron builds.
//!
//! This crate drives one or more build targets and a live-reload dev server through a
//! single lifecycle, `STARTING → STARTED → CLOSING → CLOSED`, and tears everything down
//! with one idempotent close handle.
//!
//! # Architecture
//!
//! - [`channel`] - Latest-value broadcast cells carrying status, stats, and logs
//! - [`session`] - [`CompilerSession`], the compiler + server state machine
//! - [`orchestrator`] - [`start_session`] and the composite [`CloseHandle`]
//! - [`compiler`] / [`command_compiler`] - Compiler boundary and the command-driven compiler
//! - [`server`] - Dev server boundary and the axum implementation
//! - [`proxy`] - Proxy rules, forwarding, and the [`ProxyEventLog`]
//! - [`restart`] - File fingerprinting restart alarm
//! - [`error`] - Error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use liftoff_devserver::{
//!     BuildTarget, CommandCompiler, ServerConfig, SessionParams, start_session,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> liftoff_devserver::Result<()> {
//! let target = BuildTarget::new("renderer", "dist").with_command(["npm", "run", "build"]);
//! let params = SessionParams::new(
//!     target,
//!     ServerConfig::new("localhost", 3000),
//!     Arc::new(CommandCompiler::new(".")),
//! );
//!
//! let session = start_session(params).await?;
//! println!("Listening on {}", session.url());
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod command_compiler;
pub mod compiler;
pub mod error;
pub mod orchestrator;
pub mod proxy;
pub mod restart;
pub mod server;
pub mod session;
pub mod status;
pub mod watcher;

mod waiters;

pub use channel::{BroadcastCell, CellStream, ChannelReader, Subscription};
pub use command_compiler::{CommandCompiler, MultiStats, TargetStats};
pub use compiler::{BuildTarget, BuildTargets, Compiler, CompilerHooks, TargetPlatform};
pub use error::{DevServerError, Result, TeardownError};
pub use orchestrator::{
    CloseHandle, DevSession, ExitCallback, SessionOptions, SessionParams, SessionUi, UiFeeds,
    UiHandle, start_session,
};
pub use proxy::{
    ProxyConfig, ProxyEventLog, ProxyExchange, ProxyLogRecord, ProxyObserver, ProxyOptions,
    ProxyRule, ProxyTarget, RequestSummary,
};
pub use restart::{RestartAlarm, RestartWatcher};
pub use server::{
    AxumDevServer, AxumServerFactory, HttpsConfig, ServerBackend, ServerConfig, ServerContext,
    ServerFactory,
};
pub use session::CompilerSession;
pub use status::{BuildStats, DevServerStatus, StatsData};
pub use watcher::{FileChange, FileWatcher};
