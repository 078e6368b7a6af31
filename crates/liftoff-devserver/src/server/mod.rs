//! Dev-server boundary used by the session, plus the axum implementation.

mod axum_server;

pub use axum_server::{AxumDevServer, RELOAD_SCRIPT_PATH, SSE_PATH};

use crate::channel::ChannelReader;
use crate::error::{DevServerError, Result};
use crate::proxy::ProxyConfig;
use crate::status::BuildStats;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Default dev server port
pub const DEFAULT_PORT: u16 = 3000;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// TLS certificate and key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl HttpsConfig {
    /// Check that both files exist.
    pub fn validate(&self) -> Result<()> {
        for (what, path) in [("certificate", &self.cert), ("key", &self.key)] {
            if !path.is_file() {
                return Err(DevServerError::Tls(format!(
                    "{what} not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Where and how the dev server listens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind; 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<HttpsConfig>,

    /// Extra directories served as-is, after the targets' output directories
    #[serde(default)]
    pub static_dirs: Vec<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            https: None,
            static_dirs: Vec::new(),
            proxy: None,
        }
    }
}

impl ServerConfig {
    /// Config for `host:port` with everything else defaulted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.https.is_some() { "https" } else { "http" }
    }

    /// Requested address as `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL for the address the server actually bound.
    pub fn url_for(&self, addr: SocketAddr) -> String {
        format!("{}://{}:{}", self.scheme(), self.host, addr.port())
    }
}

/// What the session hands the server when it starts listening.
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Build events, for live reload
    pub stats: ChannelReader<BuildStats>,
    /// Output directories of every build target
    pub out_dirs: Vec<PathBuf>,
}

/// A dev server the session can start and stop.
#[async_trait]
pub trait ServerBackend: Send + Sync {
    /// Bind and start serving. Returns once the socket is bound.
    async fn listen(&self, ctx: ServerContext) -> Result<SocketAddr>;

    /// Stop serving and release the socket.
    async fn stop(&self) -> Result<()>;
}

/// Builds servers from configuration.
pub trait ServerFactory: Send + Sync {
    fn create(&self, config: ServerConfig) -> Result<Arc<dyn ServerBackend>>;
}

/// Factory producing [`AxumDevServer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct AxumServerFactory;

impl ServerFactory for AxumServerFactory {
    fn create(&self, config: ServerConfig) -> Result<Arc<dyn ServerBackend>> {
        Ok(Arc::new(AxumDevServer::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.address(), "localhost:3000");
        assert_eq!(config.scheme(), "http");
    }

    #[test]
    fn test_url_uses_bound_port_and_scheme() {
        let mut config = ServerConfig::new("localhost", 0);
        let addr: SocketAddr = "127.0.0.1:41234".parse().unwrap();
        assert_eq!(config.url_for(addr), "http://localhost:41234");

        config.https = Some(HttpsConfig {
            cert: PathBuf::from("cert.pem"),
            key: PathBuf::from("key.pem"),
        });
        assert_eq!(config.url_for(addr), "https://localhost:41234");
    }

    #[test]
    fn test_https_requires_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "cert").unwrap();

        let https = HttpsConfig {
            cert: cert.clone(),
            key: dir.path().join("missing.pem"),
        };
        assert!(matches!(https.validate(), Err(DevServerError::Tls(_))));

        let key = dir.path().join("key.pem");
        std::fs::write(&key, "key").unwrap();
        assert!(HttpsConfig { cert, key }.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_proxy() {
        let json = r#"{ "host": "0.0.0.0", "port": 8080, "proxy": { "/api": "http://localhost:9999" } }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 8080);
        assert!(matches!(config.proxy, Some(ProxyConfig::Map(_))));
    }
}
