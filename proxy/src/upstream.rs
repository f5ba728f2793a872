//! Upstream targets.
//!
//! An [`Upstream`] is the base URL one listener forwards to. It turns an
//! inbound request URI into the request target sent upstream and opens the
//! HTTP/1 connection both the forwarder and the tunnel speak over.
//!
//! # Invariants
//! - The scheme is `http` or `ws`; TLS towards the upstream is never originated.
//! - `connect_addr` always carries an explicit port.

use axum::body::Body;
use axum::http::Uri;
use hyper::client::conn::http1::{self, Connection, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use url::Url;

use crate::error::ProxyError;

/// An HTTP/1 client connection to an upstream, before it has been driven.
pub type UpstreamConnection = Connection<TokioIo<TcpStream>, Body>;

/// Error returned when an upstream URL cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// The URL does not parse.
    InvalidUrl(String),
    /// The scheme is not `http` or `ws`.
    UnsupportedScheme(String),
    /// The URL has no host component.
    MissingHost,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(reason) => write!(f, "invalid upstream URL: {reason}"),
            Self::UnsupportedScheme(scheme) => {
                write!(f, "unsupported upstream scheme '{scheme}' (expected http or ws)")
            }
            Self::MissingHost => write!(f, "upstream URL has no host"),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// A parsed upstream base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// The URL exactly as configured, reported by the health responder.
    raw: String,
    url: Url,
    /// Value for the `Host` header (port omitted when it is the default).
    host_header: String,
    /// `host:port` used to open the TCP connection.
    connect_addr: String,
}

impl Upstream {
    /// Parse an upstream base URL.
    ///
    /// # Errors
    /// Returns `UpstreamError` if the URL does not parse, has no host, or uses
    /// a scheme other than `http`/`ws`.
    pub fn parse(raw: &str) -> Result<Self, UpstreamError> {
        let raw = raw.trim();
        let url = Url::parse(raw).map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;

        match url.scheme() {
            "http" | "ws" => {}
            other => return Err(UpstreamError::UnsupportedScheme(other.to_string())),
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or(UpstreamError::MissingHost)?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };

        Ok(Self {
            raw: raw.to_string(),
            connect_addr: format!("{host}:{port}"),
            host_header,
            url,
        })
    }

    /// The URL as configured.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn host_header(&self) -> &str {
        &self.host_header
    }

    #[must_use]
    pub fn connect_addr(&self) -> &str {
        &self.connect_addr
    }

    /// Build the origin-form request target for an inbound request.
    ///
    /// The base path and the request path are joined with exactly one `/`.
    /// When both the base URL and the request carry a query, they are merged
    /// as `base&request`.
    #[must_use]
    pub fn request_target(&self, uri: &Uri) -> String {
        let path = join_paths(self.url.path(), uri.path());
        let base_query = self.url.query().filter(|q| !q.is_empty());
        let request_query = uri.query().filter(|q| !q.is_empty());

        match (base_query, request_query) {
            (Some(base), Some(request)) => format!("{path}?{base}&{request}"),
            (Some(query), None) | (None, Some(query)) => format!("{path}?{query}"),
            (None, None) => path,
        }
    }

    /// Open a TCP connection to the upstream and perform the HTTP/1 client
    /// handshake.
    ///
    /// The returned connection must be spawned by the caller; the tunnel
    /// drives it with upgrades enabled, the forwarder without.
    ///
    /// # Errors
    /// Returns `ProxyError::UpstreamUnavailable` if the upstream refuses the
    /// connection or the handshake fails.
    pub async fn connect(&self) -> Result<(SendRequest<Body>, UpstreamConnection), ProxyError> {
        let stream = TcpStream::connect(&self.connect_addr).await.map_err(|e| {
            ProxyError::UpstreamUnavailable(format!("connect to {}: {e}", self.connect_addr))
        })?;

        http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::UpstreamUnavailable(format!("handshake failed: {e}")))
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}
