//! Business API forwarding
//!
//! Receives inbound requests, strips hop-by-hop and caller-supplied
//! authorization headers, and sends them through `SessionClient`, which owns
//! the session credential and its refresh. Upstream responses are returned
//! verbatim; only pipeline failures become gateway error responses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use session_client::{ApiResponse, Error, SessionClient, TransportError};
use tracing::{error, instrument, warn};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest request body the gateway buffers.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: Arc<SessionClient>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Status and error type reported for a pipeline failure.
fn classify(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        Error::RefreshFailed(_) => (StatusCode::UNAUTHORIZED, "session_expired"),
        Error::Transport(TransportError::Timeout(_)) => {
            (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
        }
        Error::Transport(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        Error::Status { .. } | Error::Decode(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
    }
}

/// Forward an inbound request through the session pipeline.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = forwardable_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return finish(
                error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("invalid request body: {e}"),
                    &request_id,
                ),
                method.as_str(),
                started,
            );
        }
    };
    let body = (!body.is_empty()).then_some(body);

    let response = match state
        .client
        .request(method.clone(), &path, Some(headers), body)
        .await
    {
        Ok(upstream) => into_response(upstream, &request_id),
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            let (status, error_type) = classify(&e);
            crate::metrics::record_upstream_error(error_type);
            if status == StatusCode::UNAUTHORIZED {
                warn!(error = %e, "session could not authorize request");
            } else {
                error!(error = %e, "upstream request failed");
            }
            error_response(status, error_type, &e.to_string(), &request_id)
        }
    };

    finish(response, method.as_str(), started)
}

fn finish(response: Response, method: &str, started: Instant) -> Response {
    crate::metrics::record_request(
        response.status().as_u16(),
        method,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Inbound headers minus hop-by-hop, `Host` and any caller `Authorization`.
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str()) || name == AUTHORIZATION || name == HOST {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn into_response(upstream: ApiResponse, request_id: &str) -> Response {
    let (status, headers, body) = upstream.into_parts();
    let mut response = Response::builder().status(status);
    for (name, value) in &headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response.body(Body::from(body)).unwrap_or_else(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "gateway_error",
            &format!("response build error: {e}"),
            request_id,
        )
    })
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
