//! Lifecycle status and build statistics values carried by the session channels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Lifecycle status of a dev-server session.
///
/// The only legal path is `Starting → Started → Closing → Closed`. The derived ordering
/// follows that path, so "at least started" is `status >= DevServerStatus::Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DevServerStatus {
    /// Compiler and server are being brought up
    Starting,
    /// The server is listening
    Started,
    /// The server stop operation is in flight
    Closing,
    /// Terminal state; the session cannot be restarted
    Closed,
}

impl DevServerStatus {
    /// The status that legally follows this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Starting => Some(Self::Started),
            Self::Started => Some(Self::Closing),
            Self::Closing => Some(Self::Closed),
            Self::Closed => None,
        }
    }

    /// Whether moving from `self` to `to` is the single legal edge.
    pub fn can_transition_to(self, to: Self) -> bool {
        self.next() == Some(to)
    }
}

impl fmt::Display for DevServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(label)
    }
}

/// Opaque compiler result.
///
/// The session never looks inside; it only forwards the value to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsData(Arc<serde_json::Value>);

impl StatsData {
    /// Wrap an already-built JSON value.
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    /// Serialize any compiler result into stats data.
    pub fn from_serializable<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(Self::new)
    }

    /// Borrow the underlying JSON value.
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl Serialize for StatsData {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Latest compiler event. Only the most recent one is retained.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BuildStats {
    /// No build has run yet
    Waiting,
    /// Sources changed and a new compile is pending
    Invalid,
    /// A compile finished
    Done {
        /// Compiler-produced result
        #[serde(rename = "statsData")]
        stats: StatsData,
    },
}

impl BuildStats {
    /// Check if a compile is pending.
    pub fn is_invalid(&self) -> bool {
        matches!(self, BuildStats::Invalid)
    }

    /// Check if a compile has finished.
    pub fn is_done(&self) -> bool {
        matches!(self, BuildStats::Done { .. })
    }

    /// Stats of the finished compile, if any.
    pub fn stats(&self) -> Option<&StatsData> {
        match self {
            BuildStats::Done { stats } => Some(stats),
            _ => None,
        }
    }
}
