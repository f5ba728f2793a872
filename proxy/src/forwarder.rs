//! HTTP forwarding to a listener's upstream.
//!
//! # Pre-conditions
//! - The request has already been admitted by the gate.
//!
//! # Post-conditions
//! - The upstream sees the original method, path, query, body, and `Host`,
//!   with the path joined onto the upstream base path.
//! - Identity headers are present exactly when claims are, each with a single
//!   value. Client-supplied copies are always dropped.
//! - Status, headers (minus hop-by-hop), and body of the upstream response are
//!   relayed unchanged.
//!
//! # Invariants
//! - Each request uses its own upstream connection; nothing is retried.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Version, header};
use axum::response::Response;
use hyper::body::Incoming;

use crate::auth::Claims;
use crate::error::ProxyError;
use crate::upstream::Upstream;

/// Header carrying the verified user identifier.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the verified user email.
pub const USER_EMAIL_HEADER: &str = "x-user-email";

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only describe the hop between two peers.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards admitted HTTP requests to one upstream.
#[derive(Debug, Clone)]
pub struct Forwarder {
    upstream: Arc<Upstream>,
    /// Deadline for connecting and receiving the upstream response head.
    timeout: Duration,
}

impl Forwarder {
    #[must_use]
    pub const fn new(upstream: Arc<Upstream>, timeout: Duration) -> Self {
        Self { upstream, timeout }
    }

    /// Forward `request` upstream and relay the response.
    ///
    /// # Errors
    /// - `ProxyError::UpstreamUnavailable` if the upstream cannot be reached or
    ///   the exchange fails.
    /// - `ProxyError::UpstreamTimeout` if no response head arrives in time.
    /// - `ProxyError::Internal` if the rewritten request cannot be built.
    pub async fn forward(
        &self,
        request: Request,
        claims: Option<&Claims>,
        client_addr: SocketAddr,
    ) -> Result<Response, ProxyError> {
        let (mut parts, body) = request.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        prepare_upstream_parts(&mut parts, &self.upstream, claims, client_addr)?;
        let request = Request::from_parts(parts, body);

        let response = tokio::time::timeout(self.timeout, self.send(request))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)??;

        Ok(relay_response(response))
    }

    async fn send(&self, request: Request) -> Result<hyper::Response<Incoming>, ProxyError> {
        let (mut sender, connection) = self.upstream.connect().await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("upstream connection closed with error: {e}");
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::UpstreamUnavailable(format!("request failed: {e}")))
    }
}

/// Rewrite request parts so they can be sent to `upstream`.
///
/// Shared by the forwarder and the tunnel handshake. Hop-by-hop headers are
/// left alone here; the tunnel needs `Connection` and `Upgrade`.
pub(crate) fn prepare_upstream_parts(
    parts: &mut Parts,
    upstream: &Upstream,
    claims: Option<&Claims>,
    client_addr: SocketAddr,
) -> Result<(), ProxyError> {
    parts.uri = upstream
        .request_target(&parts.uri)
        .parse()
        .map_err(|e| ProxyError::Internal(format!("invalid upstream request target: {e}")))?;
    parts.version = Version::HTTP_11;

    set_forwarding_headers(&mut parts.headers, upstream, client_addr)?;
    apply_identity_headers(&mut parts.headers, claims)
}

/// Set the identity headers from `claims`, replacing whatever the client sent.
///
/// With no claims both headers are removed, so a public path can never carry
/// a client-chosen identity upstream.
///
/// # Errors
/// Returns `ProxyError::Internal` if a claim is not a valid header value.
pub fn apply_identity_headers(
    headers: &mut HeaderMap,
    claims: Option<&Claims>,
) -> Result<(), ProxyError> {
    headers.remove(USER_ID_HEADER);
    headers.remove(USER_EMAIL_HEADER);

    let Some(claims) = claims else {
        return Ok(());
    };

    headers.insert(USER_ID_HEADER, header_value(claims.identity_user_id())?);
    headers.insert(USER_EMAIL_HEADER, header_value(&claims.email)?);
    Ok(())
}

fn set_forwarding_headers(
    headers: &mut HeaderMap,
    upstream: &Upstream,
    client_addr: SocketAddr,
) -> Result<(), ProxyError> {
    let client_ip = client_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let forwarded_for = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {client_ip}", prior.join(", "))
    };
    headers.insert(X_FORWARDED_FOR, header_value(&forwarded_for)?);

    // The client's Host is kept; only a request without one gets the upstream's.
    match headers.get(header::HOST).cloned() {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.insert(header::HOST, header_value(upstream.host_header())?);
        }
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    Ok(())
}

/// Tokens listed in every `Connection` header, trimmed.
pub(crate) fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Remove hop-by-hop headers, including any the `Connection` header names.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = connection_tokens(headers)
        .map(str::to_ascii_lowercase)
        .collect();

    for name in named.iter().map(String::as_str).chain(HOP_BY_HOP_HEADERS) {
        headers.remove(name);
    }
}

/// Relay an upstream response to the client without its hop-by-hop headers.
pub(crate) fn relay_response(response: hyper::Response<Incoming>) -> Response {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, Body::new(body))
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value)
        .map_err(|e| ProxyError::Internal(format!("invalid header value: {e}")))
}
