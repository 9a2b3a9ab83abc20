//! HTTP proxy logic
//!
//! Authenticates the inbound client against the hot `API_KEY`, swaps the
//! client's credential for an express key from the pool, and forwards the
//! request to the active region. A 429 is retried with the next key until
//! `max_attempts` is reached; every attempt is reported to the location
//! manager so repeated 429s can move traffic to another region. Upstream
//! responses are returned verbatim.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use common::Secret;
use tracing::{debug, error, info, instrument, warn};
use vertex_config::Settings;
use vertex_pool::{SelectedKey, UpstreamOutcome, classify_status};

use crate::config::UpstreamConfig;
use crate::context::AppContext;
use crate::metrics::{self, ServiceMetrics};

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

/// Inbound headers that carry the client's credential or describe the
/// inbound connection; never forwarded.
const CLIENT_ONLY_HEADERS: &[&str] = &["host", "authorization", "x-goog-api-key", "content-length"];

const UPSTREAM_KEY_HEADER: &str = "x-goog-api-key";

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub ctx: AppContext,
    pub client: reqwest::Client,
    pub upstream: UpstreamConfig,
    pub metrics: ServiceMetrics,
}

impl ProxyState {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }
}

/// Build the upstream client, routing through `PROXY_URL` when one is set.
///
/// The outbound proxy is read once here; changing it requires a restart.
pub fn build_client(settings: &Settings, max_connections: usize) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().pool_max_idle_per_host(max_connections);
    if let Some(proxy_url) = settings.proxy_url() {
        info!(proxy = %proxy_url, "routing upstream traffic through outbound proxy");
        builder = builder.proxy(reqwest::Proxy::all(&proxy_url)?);
    }
    builder.build()
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Decrements the in-flight gauge when the request finishes, however it ends.
struct InFlight<'a>(&'a ServiceMetrics);

impl<'a> InFlight<'a> {
    fn enter(metrics: &'a ServiceMetrics) -> Self {
        metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Proxy an inbound request and record its outcome.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let _in_flight = InFlight::enter(&state.metrics);
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let method = request.method().to_string();

    let response = match forward(state, request, &request_id).await {
        Ok(response) => response,
        Err(response) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            response
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// An error response the gateway generated itself, as opposed to a relayed
/// upstream status.
fn gateway_error(status: StatusCode, message: &str, request_id: &str) -> Result<Response, Response> {
    Err(error_response(status, message, request_id))
}

/// Forward to upstream. `Err` carries a response the gateway generated itself.
async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: &str,
) -> Result<Response, Response> {
    let ctx = &state.ctx;

    let authorized = client_credential(request.headers())
        .is_some_and(|candidate| Secret::new(ctx.settings.api_key()).matches(candidate));
    if !authorized {
        warn!("rejected request with missing or invalid API key");
        return gateway_error(StatusCode::UNAUTHORIZED, "invalid API key", request_id);
    }

    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && !is_client_only(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return gateway_error(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    let keys = attempt_keys(state);
    if keys.is_empty() {
        metrics::record_upstream_error("no_key");
        error!("no usable express API key configured");
        return gateway_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no usable express API key configured",
            request_id,
        );
    }

    let attempts = keys.len();
    for (attempt, key) in keys.into_iter().enumerate() {
        let location = ctx.locations.current_location();
        let url = format!("{}{}", state.upstream.base_url_for(&location), path_and_query);
        metrics::record_key_selection(ctx.express.label());
        debug!(attempt, key_index = key.index, location = %location, "forwarding to upstream");

        let mut attempt_headers = headers.clone();
        attempt_headers.insert(UPSTREAM_KEY_HEADER, key.header);

        let req = state
            .client
            .request(method.clone(), &url)
            .headers(attempt_headers)
            .timeout(state.timeout())
            .body(body_bytes.clone());

        match req.send().await {
            Ok(upstream_response) => {
                let status = upstream_response.status();
                report(ctx, status.as_u16());

                let outcome = classify_status(status.as_u16());
                if outcome.retry_with_next_key() && attempt + 1 < attempts {
                    metrics::record_upstream_error(outcome.label());
                    warn!(
                        attempt,
                        key_index = key.index,
                        location = %location,
                        "upstream rate limited, retrying with next key"
                    );
                    continue;
                }
                if outcome == UpstreamOutcome::RateLimited {
                    metrics::record_upstream_error(outcome.label());
                }

                return relay(upstream_response, request_id).await;
            }
            Err(e) if e.is_timeout() => {
                report(ctx, StatusCode::GATEWAY_TIMEOUT.as_u16());
                metrics::record_upstream_error("timeout");
                error!(error = %e, location = %location, "upstream timeout");
                return gateway_error(
                    StatusCode::GATEWAY_TIMEOUT,
                    &format!("upstream timeout after {}s", state.upstream.timeout_secs),
                    request_id,
                );
            }
            Err(e) => {
                report(ctx, StatusCode::BAD_GATEWAY.as_u16());
                metrics::record_upstream_error("connection");
                error!(error = %e, location = %location, "upstream request failed");
                return gateway_error(
                    StatusCode::BAD_GATEWAY,
                    &format!("upstream error: {e}"),
                    request_id,
                );
            }
        }
    }

    // Only a retried 429 continues, and only when a later key is left.
    gateway_error(
        StatusCode::BAD_GATEWAY,
        "no upstream attempt completed",
        request_id,
    )
}

/// Report one attempt to the location manager, counting any switch it caused.
fn report(ctx: &AppContext, status: u16) {
    if let Some(switch) = ctx.locations.report_status(status) {
        metrics::record_region_switch(&switch);
    }
}

/// An express key ready to go on the wire.
struct AttemptKey {
    index: usize,
    header: HeaderValue,
}

impl AttemptKey {
    fn new(key: SelectedKey) -> Option<Self> {
        match HeaderValue::from_str(key.secret.expose()) {
            Ok(mut header) => {
                header.set_sensitive(true);
                Some(Self {
                    index: key.index,
                    header,
                })
            }
            Err(_) => {
                warn!(key_index = key.index, "skipping express key with invalid characters");
                None
            }
        }
    }
}

/// Keys to try for one request: the configured selection first, then the
/// rest of the pool in order after it. Keys that cannot be sent as a header
/// are dropped before the list is capped at `max_attempts`.
fn attempt_keys(state: &ProxyState) -> Vec<AttemptKey> {
    let Some(first) = state.ctx.express.select_configured() else {
        return Vec::new();
    };
    let mut rest = state.ctx.express.list_all_indexed();
    rest.retain(|k| k.index != first.index);
    let split = rest.partition_point(|k| k.index < first.index);
    rest.rotate_left(split);

    std::iter::once(first)
        .chain(rest)
        .filter_map(AttemptKey::new)
        .take(state.upstream.max_attempts)
        .collect()
}

async fn relay(
    upstream_response: reqwest::Response,
    request_id: &str,
) -> Result<Response, Response> {
    let status = upstream_response.status();
    let resp_headers = upstream_response.headers().clone();

    match upstream_response.bytes().await {
        Ok(resp_body) => {
            let mut response = Response::builder().status(status);
            for (name, value) in &resp_headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(resp_body))
                .or_else(|e| {
                    gateway_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("response build error: {e}"),
                        request_id,
                    )
                })
        }
        Err(e) => {
            error!(error = %e, "failed to read upstream response body");
            gateway_error(
                StatusCode::BAD_GATEWAY,
                &format!("upstream response read error: {e}"),
                request_id,
            )
        }
    }
}

/// The caller's credential: `Authorization: Bearer <key>` or `x-goog-api-key`.
fn client_credential(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    bearer.or_else(|| {
        headers
            .get(UPSTREAM_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
    })
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_client_only(name: &str) -> bool {
    CLIENT_ONLY_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
