// Life of a request:
// 1. A listener accepts the connection (one listener per configured port)
// 2. `/health` is answered directly, a non-canonical path gets a 301 to the
//    clean path, everything else goes to the gate
// 3. The gate checks public path prefixes, then the token cookie
//     - HTTP: admit, or 302 to the login / invalid-token URL
//     - Upgrade handshake: admit, or 401 and close
// 4. Admitted requests:
//     - HTTP: rewrite for the upstream, set identity headers, relay response
//     - Upgrade: send the rewritten handshake upstream, then relay raw bytes
//
// System components:
//  - Key material + token verifier (shared, read-only)
//  - Authorization gate
//  - HTTP forwarder and WebSocket tunnel
//  - Listener orchestrator (startup, shared-deadline shutdown)

pub mod auth;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod listener;
pub mod orchestrator;
pub mod shutdown;
pub mod tunnel;
pub mod upstream;

#[cfg(test)]
mod e2e_tests;

pub use auth::{AuthGate, Claims, KeyMaterial};
pub use config::{EndpointConfig, ProxyConfig};
pub use error::ProxyError;
pub use orchestrator::{Orchestrator, RunningProxy, ShutdownReport};
pub use upstream::Upstream;
