//! Listener orchestration.
//!
//! Starts one [`Listener`] per configured endpoint and shuts them all down
//! against a single shared deadline.
//!
//! # Pre-conditions
//! - Configuration and key material have been loaded.
//!
//! # Post-conditions
//! - `start` either binds every endpoint or binds none (already-bound sockets
//!   are released on failure).
//! - `shutdown` always returns, at the latest shortly after the deadline; a
//!   listener that misses it is aborted and reported, never awaited further.
//!
//! # Invariants
//! - Listeners run independently; one failing never stops another.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::AuthGate;
use crate::config::{EndpointConfig, ProxyConfig};
use crate::listener::Listener;
use crate::shutdown::{self, ShutdownTrigger};

/// Error returned when a listener cannot be started.
#[derive(Debug)]
pub struct StartError {
    pub port: u16,
    pub source: std::io::Error,
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to bind port {}: {}", self.port, self.source)
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Why a listener did not stop cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownFailure {
    /// Still running at the deadline; it was forcibly closed.
    TimedOut,
    /// The listener task panicked or was cancelled.
    Failed(String),
}

/// A listener that did not stop cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerShutdownError {
    pub port: u16,
    pub failure: ShutdownFailure,
}

impl std::fmt::Display for ListenerShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.failure {
            ShutdownFailure::TimedOut => write!(
                f,
                "listener on port {} did not stop before the deadline and was closed",
                self.port
            ),
            ShutdownFailure::Failed(reason) => {
                write!(f, "listener on port {} failed: {reason}", self.port)
            }
        }
    }
}

impl std::error::Error for ListenerShutdownError {}

/// Outcome of shutting down every listener.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Ports whose listeners stopped within the deadline.
    pub stopped: Vec<u16>,
    pub failures: Vec<ListenerShutdownError>,
}

impl ShutdownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Starts the configured listeners.
pub struct Orchestrator {
    endpoints: Vec<EndpointConfig>,
    listen_host: IpAddr,
    upstream_timeout: Duration,
    gate: Arc<AuthGate>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: &ProxyConfig, gate: AuthGate) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            listen_host: config.listen_host,
            upstream_timeout: config.upstream_timeout,
            gate: Arc::new(gate),
        }
    }

    /// Bind every endpoint, then start serving all of them.
    ///
    /// # Errors
    /// Returns `StartError` for the first endpoint that cannot be bound.
    pub async fn start(self) -> Result<RunningProxy, StartError> {
        let (trigger, signal) = shutdown::channel();

        let mut bound = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            let listener = Listener::bind(
                self.listen_host,
                endpoint,
                Arc::clone(&self.gate),
                self.upstream_timeout,
                signal.clone(),
            )
            .await
            .map_err(|source| StartError {
                port: endpoint.port,
                source,
            })?;
            bound.push(listener);
        }

        let mut listeners = Vec::with_capacity(bound.len());
        for listener in bound {
            let addr = listener.local_addr();
            self.log_listener(addr, &listener);
            let handle = tokio::spawn(listener.serve(signal.clone()));
            listeners.push(RunningListener { addr, handle });
        }
        tracing::info!("total servers started: {}", listeners.len());

        Ok(RunningProxy { trigger, listeners })
    }

    fn log_listener(&self, addr: SocketAddr, listener: &Listener) {
        tracing::info!("auth proxy listening on {addr}");
        tracing::info!("  -> proxying to: {}", listener.upstream());
        tracing::info!("  -> redirect URL: {}", self.gate.redirect_url);
        tracing::info!("  -> JWT cookie: {}", self.gate.cookie_name);
        tracing::info!("  -> websocket support: enabled");
        if !self.gate.public_paths.is_empty() {
            tracing::info!("  -> public paths: {}", self.gate.public_paths.join(", "));
        }
    }
}

struct RunningListener {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

/// Handle to the serving listeners.
pub struct RunningProxy {
    trigger: ShutdownTrigger,
    listeners: Vec<RunningListener>,
}

impl RunningProxy {
    /// Bound addresses, in configuration order.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|listener| listener.addr).collect()
    }

    /// Stop every listener, waiting at most `grace` overall.
    ///
    /// Listeners stop accepting immediately, open connections are asked to
    /// finish, and tunnels close. Whatever is still running at the deadline is
    /// aborted and reported as [`ShutdownFailure::TimedOut`].
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        tracing::info!("shutting down servers...");
        self.trigger.trigger();
        let deadline = Instant::now() + grace;

        let results = join_all(
            self.listeners
                .into_iter()
                .map(|listener| stop_listener(listener, deadline)),
        )
        .await;

        let mut report = ShutdownReport::default();
        for (port, result) in results {
            match result {
                Ok(()) => report.stopped.push(port),
                Err(failure) => report.failures.push(ListenerShutdownError { port, failure }),
            }
        }
        report
    }
}

async fn stop_listener(
    mut listener: RunningListener,
    deadline: Instant,
) -> (u16, Result<(), ShutdownFailure>) {
    let port = listener.addr.port();
    let result = match tokio::time::timeout_at(deadline, &mut listener.handle).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ShutdownFailure::Failed(e.to_string())),
        Err(_elapsed) => {
            listener.handle.abort();
            Err(ShutdownFailure::TimedOut)
        }
    };
    (port, result)
}
