//! Development server with live reload via Server-Sent Events.
//!
//! Serves build output from disk, forwards proxied paths upstream, and streams build
//! events to the reload client. With `https` configured the same router is served over
//! TLS through `axum-server`.

use super::{HttpsConfig, ServerBackend, ServerConfig, ServerContext};
use crate::channel::ChannelReader;
use crate::error::{DevServerError, Result};
use crate::proxy::{ProxyTable, forward};
use crate::status::BuildStats;
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response, Sse,
        sse::{Event, KeepAlive},
    },
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use indexmap::IndexSet;
use parking_lot::Mutex;
use reqwest::Client;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

/// Live-reload event stream.
pub const SSE_PATH: &str = "/__liftoff_sse__";

/// Reload client script, injected into served HTML.
pub const RELOAD_SCRIPT_PATH: &str = "/__liftoff_reload__.js";

const RELOAD_SCRIPT: &str = include_str!("../../assets/reload-client.js");

/// How long `stop` waits for in-flight requests before aborting the server task.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    stats: ChannelReader<BuildStats>,
    roots: Arc<Vec<PathBuf>>,
    proxy: Arc<ProxyTable>,
    client: Client,
    shutdown: CancellationToken,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Axum-based dev server.
pub struct AxumDevServer {
    config: ServerConfig,
    proxy: Arc<ProxyTable>,
    client: Client,
    running: Mutex<Option<Running>>,
}

impl AxumDevServer {
    /// Create a server for `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the TLS material is missing or a proxy rule is invalid.
    pub fn new(config: ServerConfig) -> Result<Self> {
        if let Some(https) = &config.https {
            https.validate()?;
        }

        let proxy = match &config.proxy {
            Some(proxy) => ProxyTable::compile(proxy)?,
            None => ProxyTable::default(),
        };

        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| DevServerError::Tls(format!("HTTP client: {e}")))?;

        Ok(Self {
            config,
            proxy: Arc::new(proxy),
            client,
            running: Mutex::new(None),
        })
    }

    /// Whether `listen` succeeded and `stop` has not run yet.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Build the axum router with all routes.
    fn build_router(&self, state: AppState) -> Router {
        Router::new()
            .route(SSE_PATH, get(handle_sse))
            .route(RELOAD_SCRIPT_PATH, get(handle_reload_script))
            .fallback(handle_request)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .with_state(state)
    }
}

#[async_trait]
impl ServerBackend for AxumDevServer {
    async fn listen(&self, ctx: ServerContext) -> Result<SocketAddr> {
        let address = self.config.address();
        if self.is_running() {
            return Err(DevServerError::BindFailed {
                address,
                reason: "server is already listening".to_string(),
            });
        }

        // Bad certificates fail before anything is bound
        let tls = match &self.config.https {
            Some(https) => Some(load_tls(https).await?),
            None => None,
        };

        let listener = tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| DevServerError::BindFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let state = AppState {
            stats: ctx.stats,
            roots: Arc::new(search_roots(ctx.out_dirs, &self.config.static_dirs)),
            proxy: Arc::clone(&self.proxy),
            client: self.client.clone(),
            shutdown: cancel.clone(),
        };
        let app = self.build_router(state);

        let task = match tls {
            Some(tls) => spawn_tls(listener, tls, app, cancel.clone())?,
            None => spawn_plain(listener, app, cancel.clone()),
        };

        tracing::info!(%addr, url = %self.config.url_for(addr), "Dev server listening");
        *self.running.lock() = Some(Running { cancel, task });
        Ok(addr)
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take().ok_or(DevServerError::NotRunning)?;

        running.cancel.cancel();
        let mut task = running.task;

        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {
                tracing::info!("Dev server stopped");
                Ok(())
            }
            Ok(Err(join_err)) => Err(DevServerError::StopFailed(join_err.to_string())),
            Err(_) => {
                tracing::warn!(
                    "Dev server still draining after {:?}; aborting",
                    STOP_TIMEOUT
                );
                task.abort();
                Ok(())
            }
        }
    }
}

/// Output directories first, then static directories, each searched once.
fn search_roots(out_dirs: Vec<PathBuf>, static_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let roots: IndexSet<PathBuf> = out_dirs
        .into_iter()
        .chain(static_dirs.iter().cloned())
        .collect();
    roots.into_iter().collect()
}

async fn load_tls(https: &HttpsConfig) -> Result<RustlsConfig> {
    // Server configs are built against the process default crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    RustlsConfig::from_pem_file(&https.cert, &https.key)
        .await
        .map_err(|e| {
            DevServerError::Tls(format!(
                "failed to load {} and {}: {e}",
                https.cert.display(),
                https.key.display()
            ))
        })
}

fn spawn_plain(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!("Dev server error: {e}");
        }
        tracing::debug!("Dev server task finished");
    })
}

fn spawn_tls(
    listener: tokio::net::TcpListener,
    tls: RustlsConfig,
    app: Router,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let server = axum_server::from_tcp_rustls(listener, tls).handle(handle.clone());

    Ok(tokio::spawn(async move {
        let trigger = tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(STOP_TIMEOUT));
        });
        if let Err(e) = server.serve(app.into_make_service()).await {
            tracing::error!("Dev server error: {e}");
        }
        trigger.abort();
        tracing::debug!("Dev server task finished");
    }))
}

/// Handle SSE connections for live reload.
///
/// Each connection replays the latest build event, then follows new ones until the cell
/// closes or the server shuts down.
async fn handle_sse(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let mut events = state.stats.stream();
    let shutdown = state.shutdown.clone();

    tracing::debug!("Reload client connected");

    let stream = async_stream::stream! {
        loop {
            let stats = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = events.recv() => match next {
                    Some(stats) => stats,
                    None => break,
                },
            };
            match Event::default().event("stats").json_data(&stats) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!("Failed to encode build event: {e}"),
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Serve the reload client script.
async fn handle_reload_script() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/javascript"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        RELOAD_SCRIPT,
    )
}

/// Handle all other requests: proxy first, then files on disk.
async fn handle_request(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();

    if let Some(route) = state.proxy.find(&path) {
        return forward::forward(&state.client, route, request).await;
    }

    let Some(relative) = sanitize(&path) else {
        return not_found(&path);
    };

    for root in state.roots.iter() {
        let Some(file) = resolve_file(root, &relative).await else {
            continue;
        };
        match tokio::fs::read(&file).await {
            Ok(content) => {
                let content_type = determine_content_type(&file);
                let content = inject_reload_script(&content, content_type);
                return (
                    [
                        (header::CONTENT_TYPE, content_type),
                        (header::CACHE_CONTROL, "no-cache"),
                    ],
                    content,
                )
                    .into_response();
            }
            Err(e) => {
                tracing::warn!("Failed to read file {}: {}", file.display(), e);
            }
        }
    }

    not_found(&path)
}

fn not_found(path: &str) -> Response {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(format!("File not found: {path}")))
        .unwrap_or_else(|_| StatusCode::NOT_FOUND.into_response())
}

/// Request path as a relative file path, rejecting anything escaping the root.
fn sanitize(path: &str) -> Option<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(clean)
}

/// File to serve for `relative` under `root`; directories resolve to their index.html.
async fn resolve_file(root: &Path, relative: &Path) -> Option<PathBuf> {
    let candidate = root.join(relative);
    let metadata = tokio::fs::metadata(&candidate).await.ok()?;
    if metadata.is_file() {
        return Some(candidate);
    }

    let index = candidate.join("index.html");
    match tokio::fs::metadata(&index).await {
        Ok(meta) if meta.is_file() => Some(index),
        _ => None,
    }
}

/// Inject reload script into HTML content.
///
/// Adds the reload client script before the closing </body> tag.
fn inject_reload_script(content: &[u8], content_type: &str) -> Vec<u8> {
    if !content_type.starts_with("text/html") {
        return content.to_vec();
    }

    let html = String::from_utf8_lossy(content);
    let script_tag = format!(r#"<script src="{RELOAD_SCRIPT_PATH}"></script>"#);

    if let Some(pos) = html.rfind("</body>") {
        let mut result = String::with_capacity(html.len() + script_tag.len() + 10);
        result.push_str(&html[..pos]);
        result.push_str("\n  ");
        result.push_str(&script_tag);
        result.push('\n');
        result.push_str(&html[pos..]);
        return result.into_bytes();
    }

    let mut result = html.into_owned();
    result.push('\n');
    result.push_str(&script_tag);
    result.into_bytes()
}

/// Determine content type from file extension.
fn determine_content_type(path: &Path) -> &'static str {
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

    match extension {
        "wasm" => "application/wasm",
        "js" | "mjs" | "cjs" => "application/javascript",
        "json" | "map" => "application/json",
        "html" => "text/html; charset=utf-8",
        "css" => "text/css",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_reload_script_with_body() {
        let html = b"<html><body><h1>Test</h1></body></html>";
        let result = String::from_utf8(inject_reload_script(html, "text/html")).unwrap();

        let script_pos = result
            .find(r#"<script src="/__liftoff_reload__.js"></script>"#)
            .unwrap();
        let body_pos = result.find("</body>").unwrap();
        assert!(script_pos < body_pos);
    }

    #[test]
    fn test_inject_reload_script_without_body() {
        let html = b"<html><h1>Test</h1></html>";
        let result = String::from_utf8(inject_reload_script(html, "text/html")).unwrap();
        assert!(result.ends_with(r#"<script src="/__liftoff_reload__.js"></script>"#));
    }

    #[test]
    fn test_inject_reload_script_non_html() {
        let js = b"console.log('test');";
        assert_eq!(inject_reload_script(js, "application/javascript"), js);
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert_eq!(sanitize("/"), Some(PathBuf::new()));
        assert_eq!(sanitize("/app/main.js"), Some(PathBuf::from("app/main.js")));
        assert_eq!(sanitize("/./app.js"), Some(PathBuf::from("app.js")));
        assert_eq!(sanitize("/../etc/passwd"), None);
        assert_eq!(sanitize("/assets/../../secret"), None);
    }

    #[test]
    fn test_determine_content_type() {
        assert_eq!(
            determine_content_type(Path::new("main.js")),
            "application/javascript"
        );
        assert_eq!(
            determine_content_type(Path::new("index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            determine_content_type(Path::new("bundle.js.map")),
            "application/json"
        );
        assert_eq!(
            determine_content_type(Path::new("blob")),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn test_resolve_directory_to_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/index.html"), "<html></html>").unwrap();
        std::fs::write(dir.path().join("main.js"), "").unwrap();

        assert_eq!(
            resolve_file(dir.path(), Path::new("docs")).await,
            Some(dir.path().join("docs/index.html"))
        );
        assert_eq!(
            resolve_file(dir.path(), Path::new("main.js")).await,
            Some(dir.path().join("main.js"))
        );
        assert_eq!(resolve_file(dir.path(), Path::new("missing.js")).await, None);
    }

    #[test]
    fn test_search_roots_skips_repeated_directories() {
        let roots = search_roots(
            vec![PathBuf::from("dist/main"), PathBuf::from("dist/renderer")],
            &[
                PathBuf::from("public"),
                PathBuf::from("dist/main"),
                PathBuf::from("public"),
            ],
        );
        assert_eq!(
            roots,
            vec![
                PathBuf::from("dist/main"),
                PathBuf::from("dist/renderer"),
                PathBuf::from("public"),
            ]
        );
    }

    #[tokio::test]
    async fn test_unreadable_certificate_fails_before_binding() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let mut config = ServerConfig::new("127.0.0.1", 0);
        config.https = Some(HttpsConfig { cert, key });
        let server = AxumDevServer::new(config).unwrap();

        let stats = crate::channel::BroadcastCell::new("stats", BuildStats::Waiting);
        let result = server
            .listen(ServerContext {
                stats: stats.reader(),
                out_dirs: Vec::new(),
            })
            .await;
        assert!(matches!(result, Err(DevServerError::Tls(_))));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_before_listen_is_not_running() {
        let server = AxumDevServer::new(ServerConfig::new("127.0.0.1", 0)).unwrap();
        assert!(matches!(server.stop().await, Err(DevServerError::NotRunning)));
    }
}
