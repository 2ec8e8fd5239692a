//! Public-edge adapter: routes subdomain hosts into the dispatcher.
//!
//! Runs as middleware in front of the admin router. Requests whose `Host`
//! carries a `<label>.<base_domain>` subdomain are proxied through the
//! tunnel; everything else falls through to the admin surface.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, warn};

use crate::state::GatewayContext;
use crate::tunnel::dispatcher::{self, ForwardError, ForwardRequest, ForwardResponse};

/// Extract the tunnel label from a `Host` header value: strip an optional
/// port, then require the `.<base_domain>` suffix. Returns `None` for hosts
/// outside the base domain; an empty label means an invalid host.
pub fn subdomain_from_host(host: &str, base_domain: &str) -> Option<String> {
    let host = strip_port(host).to_ascii_lowercase();
    let suffix = format!(".{}", base_domain.to_ascii_lowercase());
    host.strip_suffix(suffix.as_str()).map(str::to_string)
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Middleware entry point: subdomain hosts are proxied, the rest continue
/// to the admin router.
pub async fn host_router(
    State(ctx): State<GatewayContext>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let Some(host) = host else {
        return next.run(request).await;
    };

    match subdomain_from_host(&host, &ctx.config.base_domain) {
        None => next.run(request).await,
        Some(label) if label.is_empty() => {
            error_response(StatusCode::BAD_REQUEST, "invalid subdomain")
        }
        Some(label) => proxy_through_tunnel(ctx, label, request).await,
    }
}

async fn proxy_through_tunnel(
    ctx: GatewayContext,
    subdomain: String,
    request: Request,
) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();

    let mut headers = HashMap::new();
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            // first value per name
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let body = match to_bytes(body, ctx.config.max_frame_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body exceeds the frame size limit",
            )
        }
    };

    let forward = ForwardRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    };

    match dispatcher::forward(
        &ctx.registry,
        &subdomain,
        forward,
        ctx.config.request_deadline(),
    )
    .await
    {
        Ok(upstream) => build_response(upstream, started.elapsed()),
        Err(err) => forward_error_response(&subdomain, err),
    }
}

/// Reconstruct the public response: status and headers verbatim (minus
/// hop-by-hop), body from the response frame, plus the round-trip header.
fn build_response(upstream: ForwardResponse, elapsed: Duration) -> Response {
    let status = match StatusCode::from_u16(upstream.status) {
        Ok(status) => status,
        Err(_) => {
            warn!(status = upstream.status, "invalid status code from agent");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "invalid status code from agent",
            );
        }
    };

    let mut builder = Response::builder().status(status);
    if let Some(header_map) = builder.headers_mut() {
        for (name, value) in &upstream.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    header_map.append(name, value);
                }
                _ => debug!(header = %name, "skipping unrepresentable response header"),
            }
        }
        let timing = format!("{}ms", elapsed.as_millis());
        if let Ok(value) = HeaderValue::from_str(&timing) {
            header_map.insert(HeaderName::from_static("x-tunnel-response-time"), value);
        }
    }

    builder
        .body(Body::from(upstream.body))
        .unwrap_or_else(|_| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
        })
}

fn forward_error_response(subdomain: &str, err: ForwardError) -> Response {
    let status = match err {
        ForwardError::NoSuchTunnel => StatusCode::NOT_FOUND,
        ForwardError::TunnelUnavailable(_)
        | ForwardError::UpstreamWriteFailed
        | ForwardError::TunnelClosed
        | ForwardError::Agent(_) => StatusCode::BAD_GATEWAY,
        ForwardError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        ForwardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(subdomain, error = %err, "tunnel proxy failed");
    }
    (
        status,
        Json(json!({ "error": err.to_string(), "subdomain": subdomain })),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Connection-scoped headers never copied verbatim; content-length is
/// recomputed from the buffered body.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}
