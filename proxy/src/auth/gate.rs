//! Authorization gate.
//!
//! Decides, for every inbound request or upgrade handshake, whether it is
//! admitted, redirected to a login flow, or rejected. Both entry points share
//! one policy:
//! 1. A path starting with any public prefix is admitted without claims.
//! 2. Otherwise the token cookie must be present and verify.
//!
//! They differ only in what a failure turns into: plain HTTP requests get a
//! redirect (distinguishing a missing cookie from an invalid one), upgrade
//! handshakes get a single reject outcome.

use axum::http::{HeaderMap, Uri, header};

use super::jwt::{Claims, JwtError, verify_token};
use super::key_material::KeyMaterial;
use crate::config::ProxyConfig;

/// Outcome of authorizing a plain HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpDecision {
    /// Forward the request, with claims unless the path is public.
    Admit(Option<Claims>),
    /// No token cookie: send the client to the login URL.
    RedirectMissing { location: String },
    /// The token did not verify: send the client to the invalid-token URL
    /// with its original request URI appended.
    RedirectInvalid { location: String },
}

/// Outcome of authorizing an upgrade handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeDecision {
    Admit(Option<Claims>),
    /// Missing or invalid token; the handshake fails with 401.
    Reject,
}

enum TokenCheck {
    Public,
    Missing,
    Invalid(JwtError),
    Valid(Claims),
}

/// Global authentication settings shared read-only by every listener.
#[derive(Debug, Clone)]
pub struct AuthGate {
    /// Where a request without a token cookie is redirected.
    pub redirect_url: String,
    /// Prefix of the redirect for requests whose token failed verification.
    /// The escaped original request URI is appended to it verbatim.
    pub invalid_token_redirect_url: String,
    pub cookie_name: String,
    /// Path prefixes exempt from authorization.
    pub public_paths: Vec<String>,
    pub key: KeyMaterial,
}

impl AuthGate {
    /// Build the gate from loaded configuration and key material.
    #[must_use]
    pub fn from_config(config: &ProxyConfig, key: KeyMaterial) -> Self {
        Self {
            redirect_url: config.redirect_url.clone(),
            invalid_token_redirect_url: config.invalid_token_redirect_url.clone(),
            cookie_name: config.cookie_name.clone(),
            public_paths: config.public_paths.clone(),
            key,
        }
    }

    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Authorize a plain HTTP request.
    #[must_use]
    pub fn authorize_http(&self, uri: &Uri, headers: &HeaderMap) -> HttpDecision {
        match self.check(uri.path(), headers) {
            TokenCheck::Public => HttpDecision::Admit(None),
            TokenCheck::Valid(claims) => HttpDecision::Admit(Some(claims)),
            TokenCheck::Missing => {
                tracing::info!(
                    "no token found in cookie '{}', redirecting to {}",
                    self.cookie_name,
                    self.redirect_url
                );
                HttpDecision::RedirectMissing {
                    location: self.redirect_url.clone(),
                }
            }
            TokenCheck::Invalid(e) => {
                let location = self.invalid_token_location(uri);
                tracing::info!("token rejected ({e}), redirecting to {location}");
                HttpDecision::RedirectInvalid { location }
            }
        }
    }

    /// Authorize a WebSocket upgrade handshake.
    #[must_use]
    pub fn authorize_upgrade(&self, uri: &Uri, headers: &HeaderMap) -> UpgradeDecision {
        match self.check(uri.path(), headers) {
            TokenCheck::Public => UpgradeDecision::Admit(None),
            TokenCheck::Valid(claims) => UpgradeDecision::Admit(Some(claims)),
            TokenCheck::Missing => {
                tracing::info!(
                    "websocket: no token found in cookie '{}'",
                    self.cookie_name
                );
                UpgradeDecision::Reject
            }
            TokenCheck::Invalid(e) => {
                tracing::info!("websocket: token rejected: {e}");
                UpgradeDecision::Reject
            }
        }
    }

    /// Redirect target for a request whose token failed verification.
    #[must_use]
    pub fn invalid_token_location(&self, uri: &Uri) -> String {
        let request_uri = uri
            .path_and_query()
            .map_or_else(|| uri.path(), |pq| pq.as_str());
        format!("{}{}", self.invalid_token_redirect_url, query_escape(request_uri))
    }

    fn check(&self, path: &str, headers: &HeaderMap) -> TokenCheck {
        if self.is_public_path(path) {
            tracing::debug!("public path {path}, skipping authorization");
            return TokenCheck::Public;
        }

        let Some(token) = cookie_value(headers, &self.cookie_name) else {
            return TokenCheck::Missing;
        };

        match verify_token(token, &self.key) {
            Ok(claims) => TokenCheck::Valid(claims),
            Err(e) => TokenCheck::Invalid(e),
        }
    }
}

/// Escape `value` for use inside a query string.
///
/// Only ASCII alphanumerics and `-_.~` are left as is; a space becomes `+`.
fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('*', "%2A")
        .replace("%7E", "~")
}

/// Find a cookie by exact name across every `Cookie` header.
///
/// Surrounding double quotes are stripped from the value. A cookie that is
/// present with an empty value is still returned.
#[must_use]
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| {
            let value = value.trim();
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
        })
}
