//! Connection pool for backend HTTP connections
//!
//! All routes share one pooled client; connections to the same backend
//! authority are kept alive and reused between requests.

use crate::body::{boxed, ProxyBody};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use prometheus::{IntCounter, Registry};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
}

/// Backend request counters, exported on the debug listener
#[derive(Debug, Clone)]
struct PoolStats {
    requests: IntCounter,
    failures: IntCounter,
}

impl PoolStats {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests = IntCounter::new(
            "backend_requests_total",
            "Requests sent to backends through the connection pool.",
        )?;
        let failures = IntCounter::new(
            "backend_request_failures_total",
            "Backend requests that failed before a response head arrived.",
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        Ok(Self { requests, failures })
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 100,
            idle_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    stats: PoolStats,
}

impl ConnectionPool {
    /// Build the pool and register its counters in `registry`
    pub fn new(config: PoolConfig, registry: &Registry) -> Result<Self, prometheus::Error> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_secs = config.connect_timeout.as_secs(),
            "Connection pool initialized"
        );

        Ok(Self {
            client,
            stats: PoolStats::new(registry)?,
        })
    }

    /// Send a request whose URI already points at the backend
    pub async fn send_request(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, PoolError> {
        self.stats.requests.inc();

        match self.client.request(req).await {
            Ok(response) => Ok(response.map(boxed)),
            Err(e) => {
                self.stats.failures.inc();
                Err(e.into())
            }
        }
    }
}
