//! WebSocket tunnel.
//!
//! An admitted upgrade handshake is replayed to the upstream over a fresh
//! HTTP/1 connection. If the upstream switches protocols, its 101 response is
//! returned to the client and, once both sides have upgraded, raw bytes are
//! relayed between them by two half-duplex copy tasks.
//!
//! # Pre-conditions
//! - The handshake has been admitted by the gate.
//!
//! # Post-conditions
//! - If the upstream cannot be reached, the client gets a 502 and its
//!   connection is never upgraded.
//! - If the upstream answers with anything but 101, that response is relayed
//!   without its hop-by-hop headers and no tunnel is built.
//!
//! # Invariants
//! - When one direction finishes, EOF is propagated to the other peer, which
//!   then has [`TUNNEL_DRAIN_TIMEOUT`] to finish before both sockets close.
//! - Tunnels close immediately when shutdown is requested.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};

use crate::auth::Claims;
use crate::error::ProxyError;
use crate::forwarder::{connection_tokens, prepare_upstream_parts, relay_response};
use crate::shutdown::ShutdownSignal;
use crate::upstream::Upstream;

/// How long the remaining direction may keep running after the first one ends.
pub const TUNNEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether the request is a WebSocket upgrade handshake.
///
/// `Connection` must list `upgrade` among its tokens and `Upgrade` must be
/// `websocket`, both compared case-insensitively.
#[must_use]
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade =
        connection_tokens(headers).any(|token| token.eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));

    connection_upgrade && upgrade_websocket
}

/// Response for a handshake the gate rejected.
#[must_use]
pub fn reject() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::CONNECTION, "close")],
        "Unauthorized",
    )
        .into_response()
}

/// Bytes moved in each direction of a finished tunnel.
///
/// `None` means the direction was cut off (drain window elapsed, I/O error,
/// or shutdown) rather than reaching EOF.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: Option<u64>,
    pub upstream_to_client: Option<u64>,
}

/// Opens WebSocket tunnels to one upstream.
#[derive(Debug, Clone)]
pub struct Tunnel {
    upstream: Arc<Upstream>,
    /// Deadline for connecting and receiving the upstream handshake response.
    timeout: Duration,
    shutdown: ShutdownSignal,
}

impl Tunnel {
    #[must_use]
    pub const fn new(upstream: Arc<Upstream>, timeout: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            upstream,
            timeout,
            shutdown,
        }
    }

    /// Replay the handshake upstream and, on 101, start relaying.
    ///
    /// The returned response is what the client sees: the upstream's 101 (after
    /// which the relay starts in the background) or its refusal.
    ///
    /// # Errors
    /// - `ProxyError::UpstreamUnavailable` / `UpstreamTimeout` if the upstream
    ///   cannot be reached or does not answer the handshake in time.
    /// - `ProxyError::Internal` if the rewritten handshake cannot be built.
    pub async fn open(
        &self,
        mut request: Request,
        claims: Option<&Claims>,
        client_addr: SocketAddr,
    ) -> Result<Response, ProxyError> {
        let (mut sender, connection) = tokio::time::timeout(self.timeout, self.upstream.connect())
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)??;

        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                tracing::debug!("websocket upstream connection error: {e}");
            }
        });

        // Only claim the client connection once the upstream is reachable.
        let client_upgrade = hyper::upgrade::on(&mut request);

        let (mut parts, _body) = request.into_parts();
        prepare_upstream_parts(&mut parts, &self.upstream, claims, client_addr)?;
        let handshake = Request::from_parts(parts, Body::empty());

        let mut response = tokio::time::timeout(self.timeout, sender.send_request(handshake))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)?
            .map_err(|e| ProxyError::UpstreamUnavailable(format!("handshake failed: {e}")))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::info!(
                "websocket: upstream {} answered the handshake with {}",
                self.upstream,
                response.status()
            );
            return Ok(relay_response(response));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let shutdown = self.shutdown.clone();
        let upstream = Arc::clone(&self.upstream);

        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client, upstream_io)) => {
                    tracing::debug!("websocket tunnel to {upstream} established for {client_addr}");
                    let stats = relay(TokioIo::new(client), TokioIo::new(upstream_io), shutdown).await;
                    tracing::debug!("websocket tunnel to {upstream} closed: {stats:?}");
                }
                Err(e) => tracing::warn!("websocket upgrade failed: {e}"),
            }
        });

        let (parts, _body) = response.into_parts();
        Ok(Response::from_parts(parts, Body::empty()))
    }
}

/// Relay bytes between two upgraded streams until both directions end.
pub async fn relay<C, U>(client: C, upstream: U, shutdown: ShutdownSignal) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    relay_with_drain(client, upstream, shutdown, TUNNEL_DRAIN_TIMEOUT).await
}

/// [`relay`] with an explicit drain window.
pub async fn relay_with_drain<C, U>(
    client: C,
    upstream: U,
    shutdown: ShutdownSignal,
    drain: Duration,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let mut outbound = tokio::spawn(pipe(client_read, upstream_write));
    let mut inbound = tokio::spawn(pipe(upstream_read, client_write));

    let stop = shutdown.requested();
    tokio::pin!(stop);

    let mut stats = RelayStats::default();
    tokio::select! {
        result = &mut outbound => {
            stats.client_to_upstream = copied(result);
            stats.upstream_to_client = drain_remaining(&mut inbound, drain, stop.as_mut()).await;
        }
        result = &mut inbound => {
            stats.upstream_to_client = copied(result);
            stats.client_to_upstream = drain_remaining(&mut outbound, drain, stop.as_mut()).await;
        }
        () = stop.as_mut() => {
            tracing::debug!("shutdown requested, closing tunnel");
            outbound.abort();
            inbound.abort();
        }
    }
    stats
}

/// Copy one direction, then propagate EOF to the writer's peer.
async fn pipe<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

async fn drain_remaining<F>(
    handle: &mut JoinHandle<std::io::Result<u64>>,
    drain: Duration,
    stop: Pin<&mut F>,
) -> Option<u64>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        result = tokio::time::timeout(drain, &mut *handle) => match result {
            Ok(result) => copied(result),
            Err(_elapsed) => {
                tracing::debug!("tunnel drain window elapsed, closing");
                handle.abort();
                None
            }
        },
        () = stop => {
            handle.abort();
            None
        }
    }
}

fn copied(result: Result<std::io::Result<u64>, JoinError>) -> Option<u64> {
    match result {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(e)) => {
            tracing::debug!("tunnel direction ended with error: {e}");
            None
        }
        Err(e) => {
            tracing::debug!("tunnel direction task failed: {e}");
            None
        }
    }
}
