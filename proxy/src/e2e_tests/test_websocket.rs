//! WebSocket handshakes through the tunnel.

use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::e2e_tests::helpers::*;
use crate::testing;

#[tokio::test]
async fn test_admitted_upgrade_relays_frames() {
    let upstream = spawn_websocket_upstream().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let cookie = testing::auth_cookie("12345", "user@example.com");
    let (head, mut stream) = open_websocket(addr, "/ws", Some(&cookie)).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");

    // The upstream saw the identity injected into the handshake.
    assert_eq!(read_text_frame(&mut stream).await, "hello 12345");

    stream
        .write_all(&masked_text_frame("ping"))
        .await
        .expect("write frame");
    assert_eq!(read_text_frame(&mut stream).await, "ping");

    stream
        .write_all(&masked_text_frame("second message"))
        .await
        .expect("write frame");
    assert_eq!(read_text_frame(&mut stream).await, "second message");
}

#[tokio::test]
async fn test_public_upgrade_has_no_identity() {
    let upstream = spawn_websocket_upstream().await;
    let proxy = start_proxy(&[upstream], &["/ws"]).await;
    let addr = proxy.local_addrs()[0];

    let (head, mut stream) = open_websocket(addr, "/ws", None).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");
    assert_eq!(read_text_frame(&mut stream).await, "hello anonymous");
}

#[tokio::test]
async fn test_upgrade_without_cookie_is_rejected() {
    let upstream = spawn_recording_upstream().await;
    let proxy = start_proxy(&[upstream.addr], &[]).await;
    let addr = proxy.local_addrs()[0];

    let (head, mut stream) = open_websocket(addr, "/ws", None).await;
    assert!(head.starts_with("HTTP/1.1 401"), "unexpected head: {head}");
    assert!(head.to_ascii_lowercase().contains("connection: close"));

    // The proxy closes the connection after the body.
    let mut rest = Vec::new();
    tokio::time::timeout(STEP_TIMEOUT, stream.read_to_end(&mut rest))
        .await
        .expect("connection closed")
        .expect("read body");
    assert_eq!(rest, b"Unauthorized");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.connection_count(), 0);
    assert!(upstream.received_bytes().is_empty());
}

#[tokio::test]
async fn test_upgrade_with_invalid_token_is_rejected() {
    let upstream = spawn_recording_upstream().await;
    let proxy = start_proxy(&[upstream.addr], &[]).await;
    let addr = proxy.local_addrs()[0];

    let (head, _stream) = open_websocket(addr, "/ws", Some("auth_token=forged")).await;
    assert!(head.starts_with("HTTP/1.1 401"), "unexpected head: {head}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.connection_count(), 0);
    assert!(upstream.received_bytes().is_empty());
}

/// An upstream that does not switch protocols has its answer relayed as-is.
#[tokio::test]
async fn test_upstream_refusing_upgrade_is_relayed() {
    let upstream = spawn_echo_upstream().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let cookie = testing::auth_cookie("12345", "");
    let (head, _stream) = open_websocket(addr, "/ws", Some(&cookie)).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
}

#[tokio::test]
async fn test_refused_upgrade_drops_hop_by_hop_headers() {
    let app = Router::new().route(
        "/ws",
        routing::get(|| async {
            (
                StatusCode::FORBIDDEN,
                [
                    ("connection", "keep-alive, x-trace"),
                    ("keep-alive", "timeout=5"),
                    ("x-trace", "abc"),
                    ("x-upstream", "kept"),
                ],
                "no websockets here",
            )
        }),
    );
    let upstream = spawn_upstream(app).await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let cookie = testing::auth_cookie("12345", "");
    let (head, _stream) = open_websocket(addr, "/ws", Some(&cookie)).await;
    let head = head.to_ascii_lowercase();

    assert!(head.starts_with("http/1.1 403"), "unexpected head: {head}");
    assert!(head.contains("x-upstream: kept"));
    assert!(!head.contains("keep-alive: timeout=5"));
    assert!(!head.contains("x-trace:"));
}

/// Tunnels are closed when the proxy shuts down.
#[tokio::test]
async fn test_shutdown_closes_open_tunnels() {
    let upstream = spawn_websocket_upstream().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let cookie = testing::auth_cookie("12345", "");
    let (head, mut stream) = open_websocket(addr, "/ws", Some(&cookie)).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");
    assert_eq!(read_text_frame(&mut stream).await, "hello 12345");

    let report = proxy.shutdown(Duration::from_secs(2)).await;
    assert!(report.is_clean());

    let mut rest = Vec::new();
    tokio::time::timeout(STEP_TIMEOUT, stream.read_to_end(&mut rest))
        .await
        .expect("tunnel closed")
        .expect("read to end");
}

/// The handshake reaches the upstream with the client's `Host`, so an
/// upstream comparing `Origin` against it accepts browsers behind the proxy.
#[tokio::test]
async fn test_handshake_keeps_client_host() {
    let upstream = spawn_origin_checking_upstream().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let cookie = testing::auth_cookie("12345", "");
    let origin = format!("http://{addr}");
    let (head, mut stream) = open_websocket_with(
        addr,
        "/ws",
        &[("Cookie", cookie.as_str()), ("Origin", origin.as_str())],
    )
    .await;

    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");
    assert_eq!(read_text_frame(&mut stream).await, format!("hello {addr}"));
}
