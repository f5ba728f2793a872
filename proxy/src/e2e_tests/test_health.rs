//! Health responder, one per listener.

use axum::Router;

use crate::e2e_tests::helpers::*;

#[tokio::test]
async fn test_health_reports_port_and_upstream() {
    let upstream = spawn_echo_upstream().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    // No cookie: health bypasses authorization.
    let response = get(addr, "/health", None).await;
    assert_eq!(response.status, 200);

    let body = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["port"], addr.port());
    assert_eq!(body["upstream"], format!("http://{upstream}"));

    let timestamp = body["timestamp"].as_str().expect("timestamp string");
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
}

/// Two listeners in one process each report their own pair.
#[tokio::test]
async fn test_health_is_isolated_per_listener() {
    let upstream_a = spawn_echo_upstream().await;
    let upstream_b = spawn_echo_upstream().await;
    let proxy = start_proxy(&[upstream_a, upstream_b], &[]).await;

    let addrs = proxy.local_addrs();
    assert_eq!(addrs.len(), 2);

    let body_a = get(addrs[0], "/health", None).await.json();
    let body_b = get(addrs[1], "/health", None).await.json();

    assert_eq!(body_a["port"], addrs[0].port());
    assert_eq!(body_a["upstream"], format!("http://{upstream_a}"));
    assert_eq!(body_b["port"], addrs[1].port());
    assert_eq!(body_b["upstream"], format!("http://{upstream_b}"));
}

/// Requests on each listener reach that listener's upstream only.
#[tokio::test]
async fn test_requests_reach_their_own_upstream() {
    let upstream_a = spawn_upstream(Router::new().fallback(|| async { "upstream a" })).await;
    let upstream_b = spawn_upstream(Router::new().fallback(|| async { "upstream b" })).await;
    let proxy = start_proxy(&[upstream_a, upstream_b], &["/"]).await;
    let addrs = proxy.local_addrs();

    let response_a = get(addrs[0], "/whoami", None).await;
    let response_b = get(addrs[1], "/whoami", None).await;

    assert_eq!(&response_a.body[..], b"upstream a");
    assert_eq!(&response_b.body[..], b"upstream b");
}
