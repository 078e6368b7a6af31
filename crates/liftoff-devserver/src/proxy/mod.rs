//! Request proxying for the dev server.
//!
//! A [`ProxyConfig`] comes in the two shapes front-end tooling uses:
//!
//! ```json
//! { "/api": "http://localhost:9999" }
//! { "/api": { "target": "http://localhost:9999", "changeOrigin": true } }
//! [ { "context": ["/api", "/auth"], "target": "http://localhost:9999" } ]
//! ```
//!
//! Both shapes normalize to a list of [`ProxyRule`]s. The server compiles the rules into
//! routes, matching the longest context prefix first. Every forwarded exchange is
//! reported to the rule's [`ProxyObserver`], which is how [`ProxyEventLog`] watches
//! traffic without touching it.

pub(crate) mod forward;
pub mod log;

pub use log::{DEFAULT_CAPACITY, ProxyEventLog, ProxyLogRecord, RequestSummary};

use crate::error::{DevServerError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Proxy configuration, either keyed by context or as a list of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyConfig {
    /// `{ "/api": "http://host" }` or `{ "/api": { "target": ... } }`
    Map(IndexMap<String, ProxyTarget>),
    /// `[ { "context": [...], "target": ... } ]`
    Array(Vec<ProxyRule>),
}

/// Value of one entry in the map form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyTarget {
    /// Bare target URL
    Url(String),
    /// Target with options
    Options(ProxyOptions),
}

/// Forwarding options shared by both config shapes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyOptions {
    /// Upstream base URL, e.g. `http://localhost:9999`
    pub target: String,

    /// Send the upstream host as `Host` instead of the browser's
    #[serde(default)]
    pub change_origin: bool,

    /// Extra headers added to every forwarded request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Replacement for the matched context prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,

    /// Receives every exchange forwarded by this rule
    #[serde(skip)]
    pub observer: Option<ProxyObserver>,
}

impl ProxyOptions {
    /// Options forwarding to `target` with defaults.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }
}

/// A rule of the array form: one or more contexts sharing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRule {
    /// Path prefixes handled by this rule
    #[serde(deserialize_with = "one_or_many")]
    pub context: Vec<String>,

    #[serde(flatten)]
    pub options: ProxyOptions,
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(context) => vec![context],
        OneOrMany::Many(contexts) => contexts,
    })
}

impl ProxyConfig {
    /// Build the map form from `(context, target)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), ProxyTarget::Url(v.into())))
                .collect(),
        )
    }

    /// Normalize either shape into rules, preserving declaration order.
    pub fn rules(&self) -> Vec<ProxyRule> {
        match self {
            ProxyConfig::Map(map) => map
                .iter()
                .map(|(context, target)| ProxyRule {
                    context: vec![context.clone()],
                    options: match target {
                        ProxyTarget::Url(url) => ProxyOptions::new(url.clone()),
                        ProxyTarget::Options(options) => options.clone(),
                    },
                })
                .collect(),
            ProxyConfig::Array(rules) => rules.clone(),
        }
    }

    /// Copy of this config with `observer` attached to every rule.
    ///
    /// Observers already present keep running; the shape of the config is unchanged.
    pub fn with_observer(&self, observer: &ProxyObserver) -> ProxyConfig {
        let attach = |options: &ProxyOptions| ProxyOptions {
            observer: Some(ProxyObserver::chain(options.observer.clone(), observer.clone())),
            ..options.clone()
        };

        match self {
            ProxyConfig::Map(map) => ProxyConfig::Map(
                map.iter()
                    .map(|(context, target)| {
                        let options = match target {
                            ProxyTarget::Url(url) => attach(&ProxyOptions::new(url.clone())),
                            ProxyTarget::Options(options) => attach(options),
                        };
                        (context.clone(), ProxyTarget::Options(options))
                    })
                    .collect(),
            ),
            ProxyConfig::Array(rules) => ProxyConfig::Array(
                rules
                    .iter()
                    .map(|rule| ProxyRule {
                        context: rule.context.clone(),
                        options: attach(&rule.options),
                    })
                    .collect(),
            ),
        }
    }
}

/// One forwarded request/response pair as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyExchange {
    pub method: String,
    /// Context prefix that matched
    pub context: String,
    /// Original request path and query
    pub path: String,
    /// Full upstream URL the request went to
    pub target_url: String,
    /// Upstream status, absent when the upstream was unreachable
    pub status: Option<u16>,
    /// Forwarding error, if any
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Callback receiving proxied exchanges.
///
/// A panicking observer is logged and never affects the proxied response.
#[derive(Clone)]
pub struct ProxyObserver(Arc<dyn Fn(&ProxyExchange) + Send + Sync>);

impl ProxyObserver {
    pub fn new(f: impl Fn(&ProxyExchange) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Run `first` (when present) and then `next`.
    pub fn chain(first: Option<ProxyObserver>, next: ProxyObserver) -> ProxyObserver {
        match first {
            None => next,
            Some(first) => ProxyObserver::new(move |exchange| {
                first.notify(exchange);
                next.notify(exchange);
            }),
        }
    }

    pub fn notify(&self, exchange: &ProxyExchange) {
        if panic::catch_unwind(AssertUnwindSafe(|| (self.0)(exchange))).is_err() {
            tracing::error!(path = %exchange.path, "Proxy observer panicked");
        }
    }
}

impl fmt::Debug for ProxyObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProxyObserver(..)")
    }
}

impl PartialEq for ProxyObserver {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A rule compiled for one context, ready for matching.
#[derive(Debug, Clone)]
pub(crate) struct ProxyRoute {
    pub(crate) context: String,
    pub(crate) target: reqwest::Url,
    pub(crate) options: ProxyOptions,
}

impl ProxyRoute {
    /// Upstream URL for a request path (with query) under this route's context.
    pub(crate) fn upstream_url(&self, path_and_query: &str) -> String {
        let rest = path_and_query
            .strip_prefix(self.context.as_str())
            .unwrap_or(path_and_query);
        let path = match &self.options.rewrite {
            Some(replacement) => format!("{replacement}{rest}"),
            None => format!("{}{rest}", self.context),
        };
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };

        let base = self.target.as_str().trim_end_matches('/');
        format!("{base}{path}")
    }
}

/// Compiled route table.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProxyTable {
    routes: Vec<ProxyRoute>,
}

impl ProxyTable {
    /// Validate and compile a config. Routes are ordered longest context first.
    pub(crate) fn compile(config: &ProxyConfig) -> Result<Self> {
        let mut routes = Vec::new();
        for rule in config.rules() {
            let target = reqwest::Url::parse(&rule.options.target).map_err(|e| {
                DevServerError::InvalidProxy {
                    context: rule.context.join(", "),
                    reason: format!("target '{}' is not a valid URL: {e}", rule.options.target),
                }
            })?;
            if !matches!(target.scheme(), "http" | "https") {
                return Err(DevServerError::InvalidProxy {
                    context: rule.context.join(", "),
                    reason: format!("unsupported scheme '{}'", target.scheme()),
                });
            }

            for context in &rule.context {
                if !context.starts_with('/') {
                    return Err(DevServerError::InvalidProxy {
                        context: context.clone(),
                        reason: "context must start with '/'".to_string(),
                    });
                }
                routes.push(ProxyRoute {
                    context: context.clone(),
                    target: target.clone(),
                    options: rule.options.clone(),
                });
            }
        }

        // Stable sort keeps declaration order among equal lengths
        routes.sort_by(|a, b| b.context.len().cmp(&a.context.len()));
        Ok(Self { routes })
    }

    pub(crate) fn find(&self, path: &str) -> Option<&ProxyRoute> {
        self.routes.iter().find(|route| path.starts_with(&route.context))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exchange() -> ProxyExchange {
        ProxyExchange {
            method: "GET".to_string(),
            context: "/api".to_string(),
            path: "/api/users".to_string(),
            target_url: "http://localhost:9999/api/users".to_string(),
            status: Some(200),
            error: None,
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_deserialize_map_form() {
        let json = r#"{
            "/api": "http://localhost:9999",
            "/auth": { "target": "http://localhost:7000", "changeOrigin": true }
        }"#;
        let config: ProxyConfig = serde_json::from_str(json).unwrap();
        let rules = config.rules();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].context, vec!["/api"]);
        assert_eq!(rules[0].options.target, "http://localhost:9999");
        assert!(rules[1].options.change_origin);
    }

    #[test]
    fn test_deserialize_array_form() {
        let json = r#"[
            { "context": ["/api", "/graphql"], "target": "http://localhost:9999" },
            { "context": "/ws", "target": "http://localhost:9998", "rewrite": "" }
        ]"#;
        let config: ProxyConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config, ProxyConfig::Array(_)));

        let rules = config.rules();
        assert_eq!(rules[0].context, vec!["/api", "/graphql"]);
        assert_eq!(rules[1].context, vec!["/ws"]);
        assert_eq!(rules[1].options.rewrite.as_deref(), Some(""));
    }

    #[test]
    fn test_with_observer_preserves_shape_and_routing() {
        let config = ProxyConfig::from_pairs([("/api", "http://localhost:9999")]);
        let wrapped = config.with_observer(&ProxyObserver::new(|_| {}));

        let ProxyConfig::Map(map) = &wrapped else {
            panic!("map form must stay a map");
        };
        assert_eq!(map.len(), 1);

        let before = config.rules();
        let after = wrapped.rules();
        assert_eq!(before[0].context, after[0].context);
        assert_eq!(before[0].options.target, after[0].options.target);
        assert!(before[0].options.observer.is_none());
        assert!(after[0].options.observer.is_some());
    }

    #[test]
    fn test_chained_observers_all_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let first = {
            let count = Arc::clone(&count);
            ProxyObserver::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let second = {
            let count = Arc::clone(&count);
            ProxyObserver::new(move |_| {
                count.fetch_add(10, Ordering::SeqCst);
            })
        };

        ProxyObserver::chain(Some(first), second).notify(&exchange());
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_panicking_observer_is_contained() {
        let count = Arc::new(AtomicUsize::new(0));
        let after = {
            let count = Arc::clone(&count);
            ProxyObserver::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let chained = ProxyObserver::chain(Some(ProxyObserver::new(|_| panic!("boom"))), after);

        chained.notify(&exchange());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_longest_context_wins() {
        let config = ProxyConfig::from_pairs([
            ("/api", "http://localhost:9999"),
            ("/api/v2", "http://localhost:7777"),
        ]);
        let table = ProxyTable::compile(&config).unwrap();

        assert_eq!(table.find("/api/v2/users").unwrap().context, "/api/v2");
        assert_eq!(table.find("/api/v1/users").unwrap().context, "/api");
        assert!(table.find("/index.html").is_none());
    }

    #[test]
    fn test_upstream_url_with_and_without_rewrite() {
        let config = ProxyConfig::Array(vec![
            ProxyRule {
                context: vec!["/api".to_string()],
                options: ProxyOptions::new("http://localhost:9999/"),
            },
            ProxyRule {
                context: vec!["/backend".to_string()],
                options: ProxyOptions {
                    rewrite: Some(String::new()),
                    ..ProxyOptions::new("http://localhost:9999")
                },
            },
        ]);
        let table = ProxyTable::compile(&config).unwrap();

        let api = table.find("/api/users?page=2").unwrap();
        assert_eq!(
            api.upstream_url("/api/users?page=2"),
            "http://localhost:9999/api/users?page=2"
        );

        let backend = table.find("/backend/users").unwrap();
        assert_eq!(
            backend.upstream_url("/backend/users"),
            "http://localhost:9999/users"
        );
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        let bad_url = ProxyConfig::from_pairs([("/api", "not a url")]);
        assert!(matches!(
            ProxyTable::compile(&bad_url),
            Err(DevServerError::InvalidProxy { .. })
        ));

        let bad_scheme = ProxyConfig::from_pairs([("/api", "ftp://localhost")]);
        assert!(ProxyTable::compile(&bad_scheme).is_err());

        let bad_context = ProxyConfig::from_pairs([("api", "http://localhost:9999")]);
        assert!(ProxyTable::compile(&bad_context).is_err());
    }
}
