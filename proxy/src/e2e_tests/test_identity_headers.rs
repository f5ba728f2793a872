//! Identity headers injected from verified claims.

use axum::body::Body;
use axum::http::header;

use crate::auth::Claims;
use crate::e2e_tests::helpers::*;
use crate::testing::{self, TEST_SECRET};

#[tokio::test]
async fn test_valid_token_sets_identity_headers() {
    let upstream = spawn_echo_upstream().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let cookie = testing::auth_cookie("12345", "user@example.com");
    let response = get(addr, "/dashboard", Some(&cookie)).await;

    assert_eq!(response.status, 200);
    let body = response.json();
    assert_eq!(body["path"], "/dashboard");
    assert_eq!(body["user_id"], "12345");
    assert_eq!(body["user_email"], "user@example.com");
}

#[tokio::test]
async fn test_empty_user_id_falls_back_to_subject() {
    let upstream = spawn_echo_upstream().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let claims = Claims {
        sub: "user-subject".to_string(),
        exp: Some(testing::now() + 3600),
        ..Claims::default()
    };
    let cookie = format!("auth_token={}", testing::sign_hs256(&claims, TEST_SECRET));
    let body = get(addr, "/", Some(&cookie)).await.json();

    assert_eq!(body["user_id"], "user-subject");
    assert_eq!(body["user_email"], "");
}

/// Client-supplied identity headers are replaced, not appended to.
#[tokio::test]
async fn test_spoofed_identity_is_overwritten() {
    let upstream = spawn_echo_upstream().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    let request = axum::http::Request::builder()
        .uri("/profile")
        .header(header::HOST, addr.to_string())
        .header(header::COOKIE, testing::auth_cookie("alice", "alice@example.com"))
        .header("x-user-id", "admin")
        .header("x-user-email", "admin@example.com")
        .body(Body::empty())
        .expect("request");
    let body = send(addr, request).await.json();

    assert_eq!(body["user_id"], "alice");
    assert_eq!(body["user_email"], "alice@example.com");
}

/// Claims are computed per request, even on one connection.
#[tokio::test]
async fn test_each_request_uses_its_own_token() {
    let upstream = spawn_echo_upstream().await;
    let proxy = start_proxy(&[upstream], &[]).await;
    let addr = proxy.local_addrs()[0];

    for user in ["alice", "bob", "carol"] {
        let cookie = testing::auth_cookie(user, "");
        let body = get(addr, "/me", Some(&cookie)).await.json();
        assert_eq!(body["user_id"], user);
    }
}

#[tokio::test]
async fn test_rs256_token_with_public_key_file() {
    use std::io::Write;

    use crate::auth::{AuthGate, KeyMaterial};
    use crate::orchestrator::Orchestrator;

    let upstream = spawn_echo_upstream().await;

    let mut key_file = tempfile::NamedTempFile::new().expect("temp key file");
    key_file
        .write_all(testing::RSA_PUBLIC_PEM.as_bytes())
        .expect("write key");

    let mut config = proxy_config(&[upstream], &[]);
    config.key_path = key_file.path().to_path_buf();
    let key = KeyMaterial::load(&config.key_path).expect("key loads");
    let proxy = Orchestrator::new(&config, AuthGate::from_config(&config, key))
        .start()
        .await
        .expect("proxy started");
    let addr = proxy.local_addrs()[0];

    let token = testing::sign_rs256(&testing::user_claims("rsa-user", "rsa@example.com"));
    let body = get(addr, "/", Some(&format!("auth_token={token}"))).await.json();
    assert_eq!(body["user_id"], "rsa-user");
    assert_eq!(body["user_email"], "rsa@example.com");

    // An HMAC token is not accepted by an RSA key.
    let response = get(addr, "/", Some(&testing::auth_cookie("hmac-user", ""))).await;
    assert_eq!(response.status, 302);
}
