//! Request/response handler for the proxy

use axum::{
    body::{Body, HttpBody},
    http::{
        header::{self, HeaderName},
        HeaderMap, HeaderValue, Request, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use super::context::RequestContext;
use super::server::ProxyState;
use super::streaming::{is_record_content_type, relay_chunks, relay_records, RelayEnd, UsageObserver};
use super::ProxyError;

/// Chunks buffered between the upstream reader and the client
const RELAY_CHANNEL_CAPACITY: usize = 32;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that describe a single connection and must not be forwarded
fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::PROXY_AUTHENTICATE
        || name == header::PROXY_AUTHORIZATION
        || name == header::TE
        || name == header::TRAILER
        || name.as_str() == "trailers"
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

/// Extra hop-by-hop names listed in the `Connection` header
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Proxy request handler
pub struct ProxyHandler {
    state: ProxyState,
}

impl ProxyHandler {
    pub fn new(state: ProxyState) -> Self {
        Self { state }
    }

    /// Handle an incoming request
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let ctx = RequestContext::from_request(&req);
        let span = ctx.span();
        self.forward(req, ctx).instrument(span).await
    }

    async fn forward(&self, req: Request<Body>, ctx: RequestContext) -> Response {
        let start = Instant::now();
        tracing::info!("Handle request");

        let (parts, body) = req.into_parts();
        let identity = self.state.identity.resolve(&parts.headers);
        tracing::debug!(user_id = ?identity.user_id, user_name = ?identity.user_name, "Caller identity");

        let upstream_url = upstream_url(self.state.config.upstream.base_url(), &parts.uri);
        tracing::debug!(upstream_url = %upstream_url, "Building upstream request");

        let mut upstream_req = self
            .state
            .http_client
            .request(parts.method.clone(), &upstream_url)
            .headers(outbound_headers(&parts.headers, ctx.client));

        if body.size_hint().exact() != Some(0) {
            let data = body.into_data_stream().map_err(std::io::Error::other);
            upstream_req = upstream_req.body(reqwest::Body::wrap_stream(data));
        }

        let upstream = match upstream_req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, upstream_url = %upstream_url, "Failed to connect to upstream");
                return ProxyError::Upstream(e).into_response();
            }
        };

        let status = upstream.status();
        tracing::debug!(status = %status, headers = ?upstream.headers(), "Received response from upstream");
        if status == StatusCode::NO_CONTENT {
            tracing::info!(
                status = %status,
                reason = status.canonical_reason().unwrap_or(""),
                "Upstream returned no content"
            );
        }

        let records = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .map(is_record_content_type)
            .unwrap_or(false);
        let response_headers = inbound_headers(upstream.headers());

        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let body_stream = upstream.bytes_stream().map_err(std::io::Error::other);
        let mut observer = UsageObserver::new(identity, self.state.metrics.clone());

        tokio::spawn(
            async move {
                let summary = if records {
                    relay_records(body_stream, tx, |record| observer.observe(record)).await
                } else {
                    relay_chunks(body_stream, tx).await
                };
                let elapsed_ms = start.elapsed().as_millis() as u64;

                match summary.end {
                    RelayEnd::Eof => tracing::info!(
                        status = %status,
                        bytes = summary.bytes,
                        records = summary.records,
                        usage_events = observer.events(),
                        elapsed_ms,
                        "Request completed"
                    ),
                    RelayEnd::UpstreamError => tracing::warn!(
                        status = %status,
                        bytes = summary.bytes,
                        elapsed_ms,
                        "Upstream response truncated"
                    ),
                    RelayEnd::ClientGone => tracing::info!(
                        status = %status,
                        bytes = summary.bytes,
                        elapsed_ms,
                        "Client disconnected before response finished"
                    ),
                }
            }
            .instrument(tracing::Span::current()),
        );

        let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }
}

/// Upstream URL for `uri`: base + path, query string passed through as-is
fn upstream_url(base_url: &str, uri: &Uri) -> String {
    match uri.query() {
        Some(q) => format!("{}{}?{}", base_url, uri.path(), q),
        None => format!("{}{}", base_url, uri.path()),
    }
}

/// Request headers to send upstream
///
/// Hop-by-hop headers, Host, Content-Length and Authorization are dropped.
/// X-Forwarded-For is extended with the client address and
/// X-Forwarded-Host/-Proto describe the inbound request.
fn outbound_headers(inbound: &HeaderMap, client: Option<SocketAddr>) -> HeaderMap {
    let listed = connection_tokens(inbound);
    let mut out = HeaderMap::with_capacity(inbound.len() + 3);

    for (name, value) in inbound.iter() {
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::AUTHORIZATION
            || listed.iter().any(|t| t == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Some(client) = client {
        let prior: Vec<&str> = inbound
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let forwarded_for = if prior.is_empty() {
            client.ip().to_string()
        } else {
            format!("{}, {}", prior.join(", "), client.ip())
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            out.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = inbound.get(header::HOST) {
        out.insert(X_FORWARDED_HOST, host.clone());
    }
    out.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    out
}

/// Response headers to send back to the client
fn inbound_headers(upstream: &HeaderMap) -> HeaderMap {
    let listed = connection_tokens(upstream);
    let mut out = HeaderMap::with_capacity(upstream.len());

    for (name, value) in upstream.iter() {
        // Body length is re-derived by the server
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH || listed.iter().any(|t| t == name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    out
}
