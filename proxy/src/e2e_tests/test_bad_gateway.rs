//! Unreachable upstreams become 502 responses, never listener failures.

use crate::e2e_tests::helpers::*;
use crate::error::BAD_GATEWAY_MESSAGE;
use crate::testing;

#[tokio::test]
async fn test_refused_upstream_returns_bad_gateway() {
    let upstream = closed_addr().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let response = get(addr, "/", Some(&testing::auth_cookie("12345", ""))).await;

    assert_eq!(response.status, 502);
    let body = response.json();
    assert_eq!(body["error"], "Bad Gateway");
    assert_eq!(body["message"], BAD_GATEWAY_MESSAGE);
}

#[tokio::test]
async fn test_listener_keeps_serving_after_upstream_failure() {
    let upstream = closed_addr().await;
    let proxy = start_proxy(&[upstream], &["/"]).await;
    let addr = proxy.local_addrs()[0];

    for _ in 0..3 {
        assert_eq!(get(addr, "/", None).await.status, 502);
    }
    assert_eq!(get(addr, "/health", None).await.status, 200);
}

#[tokio::test]
async fn test_refused_upstream_on_upgrade_is_not_hijacked() {
    let upstream = closed_addr().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let cookie = testing::auth_cookie("12345", "");
    let (head, _stream) = open_websocket(addr, "/ws", Some(&cookie)).await;

    assert!(head.starts_with("HTTP/1.1 502"), "unexpected head: {head}");
    assert!(!head.to_ascii_lowercase().contains("upgrade: websocket"));
}
