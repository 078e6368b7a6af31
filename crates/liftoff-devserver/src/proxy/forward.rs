//! Forwarding of proxied requests to their upstream, with streaming responses.

use super::{ProxyExchange, ProxyRoute};
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::TryStreamExt;
use reqwest::Client;
use std::time::Instant;
use tracing::{debug, warn};

/// Headers that should NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    // Recomputed for the upstream request
    "host",
    "content-length",
];

fn should_forward_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    !HOP_BY_HOP_HEADERS.contains(&lower.as_str())
}

/// Forward `request` through `route`, reporting the exchange to the route's observer.
pub(crate) async fn forward(client: &Client, route: &ProxyRoute, request: Request) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let upstream_url = route.upstream_url(&path);

    let mut exchange = ProxyExchange {
        method: parts.method.to_string(),
        context: route.context.clone(),
        path,
        target_url: upstream_url.clone(),
        status: None,
        error: None,
        elapsed: Default::default(),
    };

    debug!(method = %parts.method, upstream = %upstream_url, "Forwarding proxied request");

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return fail(route, exchange, started, StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let mut req_builder = client.request(parts.method.clone(), &upstream_url);
    for (name, value) in parts.headers.iter() {
        if should_forward_header(name.as_str()) {
            req_builder = req_builder.header(name, value);
        }
    }
    if !route.options.change_origin {
        if let Some(host) = parts.headers.get(header::HOST) {
            req_builder = req_builder.header(header::HOST, host);
        }
    }
    for (name, value) in &route.options.headers {
        req_builder = req_builder.header(name.as_str(), value.as_str());
    }

    let upstream = match req_builder.body(body).send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(upstream = %upstream_url, "Proxy upstream unreachable: {e}");
            return fail(route, exchange, started, StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    let status = upstream.status();
    exchange.status = Some(status.as_u16());
    exchange.elapsed = started.elapsed();
    notify(route, &exchange);

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers().iter() {
        if should_forward_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    // Stream the body so event streams and large downloads pass through untouched
    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn fail(
    route: &ProxyRoute,
    mut exchange: ProxyExchange,
    started: Instant,
    status: StatusCode,
    error: String,
) -> Response {
    exchange.elapsed = started.elapsed();
    exchange.error = Some(error.clone());
    notify(route, &exchange);

    let mut response = (status, format!("Proxy error: {error}")).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn notify(route: &ProxyRoute, exchange: &ProxyExchange) {
    if let Some(observer) = &route.options.observer {
        observer.notify(exchange);
    }
}
