//! Error types for the development-server session.
//!
//! Errors fall into four groups, and each group propagates differently:
//!
//! - **Start-time failures** (`BindFailed`, `Compiler`, `NoTargets`) are returned
//!   straight to whoever called `start` / `start_session`.
//! - **Stop-time failures** (`StopFailed`) are collected into a [`TeardownError`] by the
//!   close handle. They never stop the remaining teardown steps.
//! - **Redundant operations** (closing twice, closing before start) are not errors at all.
//! - **Observer failures** (a panicking subscriber) are logged by the channel and never
//!   surface here.

use crate::status::DevServerStatus;
use std::fmt;
use thiserror::Error;

/// Errors produced by the session, its collaborators, and the orchestrator.
#[derive(Debug, Error)]
pub enum DevServerError {
    /// The dev server could not bind its listening socket.
    #[error("Failed to bind to {address}: {reason}\n\nHint: Pick another port or use port 0 for an ephemeral one")]
    BindFailed {
        /// Address that was requested
        address: String,
        /// Underlying OS error message
        reason: String,
    },

    /// `stop` was called on a server that is not listening.
    #[error("Server is not running")]
    NotRunning,

    /// The server (or compiler) failed while shutting down.
    #[error("Server stop failed: {0}")]
    StopFailed(String),

    /// The compiler could not be started or closed.
    #[error("Compiler error: {0}")]
    Compiler(String),

    /// No build target was supplied.
    #[error("No build targets configured\n\nHint: Provide at least one target with an entry and an output directory")]
    NoTargets,

    /// `start` was called on a session that already started once.
    #[error("Session was already started; create a new session to start again")]
    AlreadyStarted,

    /// The session start failed, so the pending wait can never succeed.
    #[error("Session start was aborted before the server started listening")]
    StartAborted,

    /// The session was dropped while a caller still waited on it.
    #[error("Session was dropped before reaching {0}")]
    SessionDropped(DevServerStatus),

    /// A proxy rule cannot be used for forwarding.
    #[error("Invalid proxy rule '{context}': {reason}")]
    InvalidProxy {
        /// Context path of the rule
        context: String,
        /// Why it was rejected
        reason: String,
    },

    /// TLS material was configured but is unusable.
    #[error("Invalid TLS configuration: {0}")]
    Tls(String),

    /// The interactive UI failed to mount or unmount.
    #[error("UI error: {0}")]
    Ui(String),

    /// File watching errors
    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// I/O errors from file system or process operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Teardown finished but one or more steps reported failures.
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

/// Failures collected while tearing a session down.
///
/// Teardown always runs every step; this type only reports what went wrong along the way.
#[derive(Debug, Default)]
pub struct TeardownError {
    errors: Vec<DevServerError>,
}

impl TeardownError {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure.
    pub fn push(&mut self, error: DevServerError) {
        self.errors.push(error);
    }

    /// Whether no failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Recorded failures, in the order they happened.
    pub fn errors(&self) -> &[DevServerError] {
        &self.errors
    }

    /// `Ok(())` when nothing failed, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), TeardownError> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Teardown finished with {} error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}

/// Result type alias using `DevServerError` as the default error type.
pub type Result<T, E = DevServerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_failed_has_hint() {
        let err = DevServerError::BindFailed {
            address: "127.0.0.1:3000".to_string(),
            reason: "address in use".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:3000"));
        assert!(msg.contains("address in use"));
        assert!(msg.contains("Hint:"));
    }

    #[test]
    fn test_teardown_error_lists_every_failure() {
        let mut teardown = TeardownError::new();
        assert!(teardown.is_empty());

        teardown.push(DevServerError::StopFailed("socket busy".to_string()));
        teardown.push(DevServerError::Ui("terminal gone".to_string()));

        let msg = teardown.to_string();
        assert!(msg.contains("2 error(s)"));
        assert!(msg.contains("socket busy"));
        assert!(msg.contains("terminal gone"));
        assert!(teardown.into_result().is_err());
    }

    #[test]
    fn test_empty_teardown_is_ok() {
        assert!(TeardownError::new().into_result().is_ok());
    }

    #[test]
    fn test_session_dropped_names_status() {
        let err = DevServerError::SessionDropped(DevServerStatus::Closed);
        assert!(err.to_string().contains("CLOSED"));
    }
}
