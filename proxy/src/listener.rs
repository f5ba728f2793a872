//! One listening endpoint.
//!
//! A [`Listener`] owns a bound socket and the routing surface for one
//! `(port, upstream)` pair: `/health` is answered directly, every other
//! request goes through the gate and then to the forwarder or the tunnel.
//! Requests whose path is not canonical are redirected to the clean path
//! before authorization, so the gate and the upstream see the same path.
//!
//! Connections are driven by hyper with upgrades enabled and tracked in a
//! `JoinSet` owned by the serve loop, so dropping the serve future drops
//! every connection it accepted.
//!
//! # Invariants
//! - A failure while handling one connection never stops the listener.
//! - Listeners share only the read-only gate.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::{SecondsFormat, Utc};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::auth::{AuthGate, HttpDecision, UpgradeDecision};
use crate::config::EndpointConfig;
use crate::error::ProxyError;
use crate::forwarder::Forwarder;
use crate::shutdown::ShutdownSignal;
use crate::tunnel::{self, Tunnel};
use crate::upstream::Upstream;

/// Path answered by the health responder on every listener.
pub const HEALTH_PATH: &str = "/health";

/// How long a client may take to send a complete request head.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct ListenerState {
    gate: Arc<AuthGate>,
    forwarder: Forwarder,
    tunnel: Tunnel,
    upstream: Arc<Upstream>,
    port: u16,
}

/// A bound listener, not yet serving.
pub struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    upstream: Arc<Upstream>,
    router: Router,
}

impl Listener {
    /// Bind the endpoint's port on `host` and build its routing surface.
    ///
    /// # Errors
    /// Returns the I/O error if the port cannot be bound.
    pub async fn bind(
        host: IpAddr,
        endpoint: &EndpointConfig,
        gate: Arc<AuthGate>,
        upstream_timeout: Duration,
        shutdown: ShutdownSignal,
    ) -> std::io::Result<Self> {
        let socket = TcpListener::bind(SocketAddr::new(host, endpoint.port)).await?;
        let local_addr = socket.local_addr()?;

        let upstream = Arc::new(endpoint.upstream.clone());
        let state = ListenerState {
            gate,
            forwarder: Forwarder::new(Arc::clone(&upstream), upstream_timeout),
            tunnel: Tunnel::new(Arc::clone(&upstream), upstream_timeout, shutdown),
            upstream: Arc::clone(&upstream),
            port: local_addr.port(),
        };

        Ok(Self {
            socket,
            local_addr,
            upstream,
            router: router(state),
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Accept connections until shutdown is requested, then stop accepting,
    /// ask every open connection to finish, and wait for them.
    pub async fn serve(self, shutdown: ShutdownSignal) {
        let Self {
            socket,
            local_addr,
            router,
            ..
        } = self;
        let port = local_addr.port();
        let mut connections = JoinSet::new();

        let stop = shutdown.clone().requested();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                () = &mut stop => break,
                accepted = socket.accept() => match accepted {
                    Ok((stream, remote)) => {
                        connections.spawn(serve_connection(
                            stream,
                            remote,
                            router.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("[port {port}] failed to accept connection: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(socket);
        tracing::info!(
            "[port {port}] stopped accepting, waiting for {} connection(s)",
            connections.len()
        );
        while connections.join_next().await.is_some() {}
        tracing::info!("[port {port}] stopped");
    }
}

fn router(state: ListenerState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .fallback(proxy)
        .with_state(state)
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    router: Router,
    shutdown: ShutdownSignal,
) {
    let service = TowerToHyperService::new(router.layer(Extension(ConnectInfo(remote))));
    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(connection);

    let stop = shutdown.requested();
    tokio::pin!(stop);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        () = &mut stop => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        tracing::debug!("connection from {remote} closed with error: {e}");
    }
}

async fn health(State(state): State<ListenerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "port": state.port,
        "upstream": state.upstream.as_str(),
    }))
}

async fn proxy(
    State(state): State<ListenerState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let port = state.port;

    if let Some(location) = canonical_location(request.uri()) {
        tracing::debug!(
            "[port {port}] redirecting non-canonical path {} to {location}",
            request.uri().path()
        );
        return redirect(StatusCode::MOVED_PERMANENTLY, &location);
    }

    if tunnel::is_upgrade_request(request.headers()) {
        let claims = match state.gate.authorize_upgrade(request.uri(), request.headers()) {
            UpgradeDecision::Admit(claims) => claims,
            UpgradeDecision::Reject => return tunnel::reject(),
        };

        tracing::info!(
            "[port {port}] proxying websocket upgrade for {} to {}",
            request.uri().path(),
            state.upstream
        );
        return match state.tunnel.open(request, claims.as_ref(), client_addr).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("[port {port}] websocket proxy error: {e}");
                e.into_response()
            }
        };
    }

    match state.gate.authorize_http(request.uri(), request.headers()) {
        HttpDecision::Admit(claims) => {
            tracing::debug!(
                "[port {port}] proxying {} {} to {}",
                request.method(),
                request.uri().path(),
                state.upstream
            );
            match state
                .forwarder
                .forward(request, claims.as_ref(), client_addr)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!("[port {port}] proxy error: {e}");
                    e.into_response()
                }
            }
        }
        HttpDecision::RedirectMissing { location } | HttpDecision::RedirectInvalid { location } => {
            redirect(StatusCode::FOUND, &location)
        }
    }
}

/// Redirect to `location` with the given 3xx status.
fn redirect(status: StatusCode, location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(location) => (status, [(header::LOCATION, location)]).into_response(),
        Err(e) => ProxyError::Internal(format!("invalid redirect location: {e}")).into_response(),
    }
}

/// Where a request with a non-canonical path is sent, keeping its query.
///
/// `None` when the path is already canonical. Percent-encoded dots and
/// slashes count as their literal characters, so `/a/%2e%2e/b` and
/// `/a/..%2Fb` are both sent to `/b`.
fn canonical_location(uri: &Uri) -> Option<String> {
    let raw = uri.path();
    if !raw.starts_with('/') {
        return None;
    }

    let path = decode_separators(raw);
    let cleaned = clean_path(&path);
    if cleaned == path {
        return None;
    }

    Some(match uri.query() {
        Some(query) => format!("{cleaned}?{query}"),
        None => cleaned,
    })
}

/// Resolve `.` and `..` segments and collapse repeated slashes. A trailing
/// slash is kept; `..` never climbs above the root.
fn clean_path(path: &str) -> String {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut cleaned = String::with_capacity(path.len());
    for segment in segments {
        cleaned.push('/');
        cleaned.push_str(segment);
    }
    if cleaned.is_empty() || path.ends_with('/') {
        cleaned.push('/');
    }
    cleaned
}

/// Decode `%2e` and `%2f` (any case); every other escape is left alone.
fn decode_separators(path: &str) -> Cow<'_, str> {
    if !path.contains('%') {
        return Cow::Borrowed(path);
    }

    let mut decoded = String::with_capacity(path.len());
    let mut rest = path;
    while let Some(index) = rest.find('%') {
        decoded.push_str(&rest[..index]);
        let escape = rest.get(index..index + 3).map(str::to_ascii_lowercase);
        let (replacement, consumed) = match escape.as_deref() {
            Some("%2e") => ('.', 3),
            Some("%2f") => ('/', 3),
            _ => ('%', 1),
        };
        decoded.push(replacement);
        rest = &rest[index + consumed..];
    }
    decoded.push_str(rest);
    Cow::Owned(decoded)
}
