//! Timestamped log of proxied requests.

use super::{ProxyConfig, ProxyExchange, ProxyObserver};
use crate::channel::{BroadcastCell, ChannelReader};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Records kept by default.
pub const DEFAULT_CAPACITY: usize = 100;

/// What the log keeps about one proxied request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub method: String,
    /// Context prefix that routed the request, e.g. `/api`
    pub context: String,
    pub path: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl From<&ProxyExchange> for RequestSummary {
    fn from(exchange: &ProxyExchange) -> Self {
        Self {
            method: exchange.method.clone(),
            context: exchange.context.clone(),
            path: exchange.path.clone(),
            target: exchange.target_url.clone(),
            status: exchange.status,
            error: exchange.error.clone(),
            duration_ms: exchange.elapsed.as_millis() as u64,
        }
    }
}

/// One entry of the proxy log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyLogRecord {
    /// Position in the log, increasing from 1
    pub seq: u64,
    pub timestamp: DateTime<Local>,
    pub request: RequestSummary,
}

impl fmt::Display for ProxyLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let req = &self.request;
        write!(
            f,
            "[{}] {} {} -> {}",
            self.timestamp.format("%H:%M:%S"),
            req.method,
            req.path,
            req.target
        )?;
        match (&req.status, &req.error) {
            (Some(status), _) => write!(f, " {status} ({}ms)", req.duration_ms),
            (None, Some(error)) => write!(f, " failed: {error}"),
            (None, None) => Ok(()),
        }
    }
}

#[derive(Default)]
struct Buffer {
    records: VecDeque<ProxyLogRecord>,
    last_seq: u64,
}

struct LogInner {
    capacity: usize,
    buffer: Mutex<Buffer>,
    records: BroadcastCell<Vec<ProxyLogRecord>>,
}

/// Observes proxy traffic and republishes it as batches of timestamped records.
///
/// Every exchange publishes the whole buffered batch (the latest `capacity` records,
/// oldest first). Consumers needing deltas diff consecutive batches themselves.
#[derive(Clone)]
pub struct ProxyEventLog {
    inner: Arc<LogInner>,
}

impl ProxyEventLog {
    /// Create a log keeping at most `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LogInner {
                capacity: capacity.max(1),
                buffer: Mutex::new(Buffer::default()),
                records: BroadcastCell::new("proxy-log", Vec::new()),
            }),
        }
    }

    /// Functionally identical proxy config whose exchanges are also logged here.
    pub fn wrap(&self, config: &ProxyConfig) -> ProxyConfig {
        let log = self.clone();
        config.with_observer(&ProxyObserver::new(move |exchange| log.record(exchange)))
    }

    /// Stream of record batches.
    pub fn records(&self) -> ChannelReader<Vec<ProxyLogRecord>> {
        self.inner.records.reader()
    }

    /// Latest published batch.
    pub fn snapshot(&self) -> Vec<ProxyLogRecord> {
        self.inner.records.get()
    }

    /// Stop logging and complete every subscriber. Idempotent.
    pub fn close(&self) {
        self.inner.records.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.records.is_closed()
    }

    fn record(&self, exchange: &ProxyExchange) {
        if self.is_closed() {
            return;
        }

        let batch: Vec<_> = {
            let mut buffer = self.inner.buffer.lock();
            buffer.last_seq += 1;
            let record = ProxyLogRecord {
                seq: buffer.last_seq,
                timestamp: Local::now(),
                request: RequestSummary::from(exchange),
            };
            tracing::debug!(%record, "Proxied request");

            buffer.records.push_back(record);
            while buffer.records.len() > self.inner.capacity {
                buffer.records.pop_front();
            }
            buffer.records.iter().cloned().collect()
        };

        // Published outside the buffer lock; a batch overtaken by a newer one is dropped
        let newest = batch.last().map_or(0, |r| r.seq);
        self.inner.records.publish_if(
            |current| current.last().is_none_or(|r| r.seq < newest),
            batch,
        );
    }
}

impl Default for ProxyEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for ProxyEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEventLog")
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
