//! Proxy configuration module.
//!
//! This module provides configuration loading for the proxy from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `SERVERS`: `PORT:UPSTREAM_URL` pairs separated by commas, e.g.
//!   `3000:http://localhost:8080,3001:http://localhost:8081`
//! - `PORT` / `UPSTREAM_URL`: single listener, used when `SERVERS` is unset
//!   (defaults: `3000`, `http://localhost:8080`)
//! - `REDIRECT_URL`: login redirect for requests without a token
//!   (default: `http://localhost:3001/login`)
//! - `JWT_TIMEOUT_URL`: redirect prefix for invalid tokens (default: `REDIRECT_URL`)
//! - `JWT_COOKIE_NAME`: cookie carrying the token (default: `auth_token`)
//! - `PUBLIC_PATHS`: comma-separated path prefixes that skip authorization
//! - `JWT_KEY_PATH`: key file used to verify tokens (required)
//! - `LISTEN_HOST`: address every listener binds to (default: `0.0.0.0`)
//! - `UPSTREAM_TIMEOUT_SECS`: deadline for an upstream response (default: `15`)
//! - `SHUTDOWN_TIMEOUT_SECS`: shared graceful-shutdown deadline (default: `10`)
//!
//! # Invariants
//!
//! - `endpoints` is never empty and holds no duplicate ports.
//! - Every endpoint port is in the range 1-65535.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::upstream::Upstream;

/// One listener: the port it binds and the upstream it forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub port: u16,
    pub upstream: Upstream,
}

/// Proxy configuration.
///
/// Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listeners to start, in configuration order.
    pub endpoints: Vec<EndpointConfig>,
    pub redirect_url: String,
    pub invalid_token_redirect_url: String,
    pub cookie_name: String,
    pub public_paths: Vec<String>,
    pub key_path: PathBuf,
    pub listen_host: IpAddr,
    pub upstream_timeout: Duration,
    pub shutdown_timeout: Duration,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.into(),
    }
}

impl ProxyConfig {
    pub const DEFAULT_PORT: u16 = 3000;
    pub const DEFAULT_UPSTREAM_URL: &'static str = "http://localhost:8080";
    pub const DEFAULT_REDIRECT_URL: &'static str = "http://localhost:3001/login";
    pub const DEFAULT_COOKIE_NAME: &'static str = "auth_token";
    pub const DEFAULT_LISTEN_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `JWT_KEY_PATH` is not set or is empty
    /// - `SERVERS`, `PORT`, or `UPSTREAM_URL` describe an invalid endpoint
    /// - a numeric or address variable does not parse
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unset and empty variables are treated the same way.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ProxyConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let endpoints = match var("SERVERS") {
            Some(servers) => parse_servers(&servers)?,
            None => vec![Self::single_endpoint(var("PORT"), var("UPSTREAM_URL"))?],
        };

        let redirect_url = var("REDIRECT_URL").unwrap_or_else(|| Self::DEFAULT_REDIRECT_URL.to_string());
        let invalid_token_redirect_url = var("JWT_TIMEOUT_URL").unwrap_or_else(|| redirect_url.clone());
        let cookie_name = var("JWT_COOKIE_NAME").unwrap_or_else(|| Self::DEFAULT_COOKIE_NAME.to_string());
        let public_paths = var("PUBLIC_PATHS")
            .map(|paths| parse_public_paths(&paths))
            .unwrap_or_default();

        let key_path = var("JWT_KEY_PATH")
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("JWT_KEY_PATH".to_string()))?;

        let listen_host = match var("LISTEN_HOST") {
            Some(host) => host
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| invalid("LISTEN_HOST", format!("'{host}' is not an IP address")))?,
            None => Self::DEFAULT_LISTEN_HOST,
        };

        let upstream_timeout = load_seconds(var("UPSTREAM_TIMEOUT_SECS"), "UPSTREAM_TIMEOUT_SECS")?
            .unwrap_or(Self::DEFAULT_UPSTREAM_TIMEOUT);
        let shutdown_timeout = load_seconds(var("SHUTDOWN_TIMEOUT_SECS"), "SHUTDOWN_TIMEOUT_SECS")?
            .unwrap_or(Self::DEFAULT_SHUTDOWN_TIMEOUT);

        Ok(Self {
            endpoints,
            redirect_url,
            invalid_token_redirect_url,
            cookie_name,
            public_paths,
            key_path,
            listen_host,
            upstream_timeout,
            shutdown_timeout,
        })
    }

    /// Fallback used when `SERVERS` is unset.
    fn single_endpoint(
        port: Option<String>,
        upstream_url: Option<String>,
    ) -> Result<EndpointConfig, ConfigError> {
        let port = match port {
            Some(value) => parse_port(&value, "PORT")?,
            None => Self::DEFAULT_PORT,
        };
        let raw = upstream_url.unwrap_or_else(|| Self::DEFAULT_UPSTREAM_URL.to_string());
        let upstream = Upstream::parse(&raw).map_err(|e| invalid("UPSTREAM_URL", e.to_string()))?;
        Ok(EndpointConfig { port, upstream })
    }
}

/// Parse `SERVERS`.
///
/// Each entry is split on its first `:` only, so the upstream URL keeps its
/// own scheme and port separators. Blank entries are skipped.
fn parse_servers(servers: &str) -> Result<Vec<EndpointConfig>, ConfigError> {
    let mut endpoints: Vec<EndpointConfig> = Vec::new();

    for entry in servers.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (port, url) = entry
            .split_once(':')
            .ok_or_else(|| invalid("SERVERS", format!("invalid server configuration: {entry}")))?;

        let port = parse_port(port, "SERVERS")?;
        if endpoints.iter().any(|endpoint| endpoint.port == port) {
            return Err(invalid("SERVERS", format!("port {port} is configured more than once")));
        }

        let upstream = Upstream::parse(url)
            .map_err(|e| invalid("SERVERS", format!("{entry}: {e}")))?;
        endpoints.push(EndpointConfig { port, upstream });
    }

    if endpoints.is_empty() {
        return Err(invalid("SERVERS", "no server configured"));
    }
    Ok(endpoints)
}

fn parse_port(value: &str, name: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(invalid(
            name,
            format!("'{value}' is not a valid port number (must be 1-65535)"),
        )),
    }
}

fn parse_public_paths(paths: &str) -> Vec<String> {
    paths
        .split(',')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_seconds(value: Option<String>, name: &str) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| invalid(name, format!("'{value}' is not a whole number of seconds")))
        })
        .transpose()
}
