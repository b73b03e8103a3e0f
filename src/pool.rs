//! Connection pool for app container HTTP connections
//!
//! Containers publish on loopback, so every upstream is `127.0.0.1:{port}`.
//! One pooled client is shared by all apps; idle connections are kept per
//! port.

use crate::config::ServerConfig;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// True for headers the proxy sets itself or that only apply to one hop
pub fn is_hop_header(name: &HeaderName) -> bool {
    name == hyper::header::HOST
        || name == hyper::header::CONTENT_LENGTH
        || HOP_BY_HOP.contains(&name.as_str())
}

/// Drop hop-by-hop headers from an upstream response before relaying it
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per upstream port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Send `req` to the container on `port`, replacing its path with
    /// `path_and_query` and its Host with the upstream address.
    ///
    /// Content-Length is not copied; hyper derives it from the body.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
        path_and_query: &str,
    ) -> Result<Response<Incoming>, PoolError> {
        let authority = format!("127.0.0.1:{}", port);
        let uri = format!("http://{}{}", authority, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if !is_hop_header(key) {
                builder = builder.header(key, value);
            }
        }
        let host = HeaderValue::from_str(&authority)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        builder = builder.header(hyper::header::HOST, host);

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        Ok(self.client.request(upstream_req).await?)
    }
}
