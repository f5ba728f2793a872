//! End-to-end tests over real loopback sockets.
//!
//! Each test starts its own upstreams and proxy on ephemeral ports, so tests
//! can run in parallel. Each file covers one scenario.

#![cfg(test)]
#![allow(clippy::expect_used, clippy::unwrap_used)]


mod test_bad_gateway;
mod test_health;
mod test_identity_headers;
mod test_websocket;
