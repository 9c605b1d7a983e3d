//! Debug listener exposing Prometheus metrics and a health check
//!
//! Bound to a loopback address by default; it never sees routed traffic.

use crate::body::{full, ProxyBody};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full(body))
        .expect("valid response with StatusCode enum")
}

/// Debug server for metrics scraping and health checks
pub struct DebugServer {
    bind_addr: SocketAddr,
    registry: Registry,
    shutdown_rx: watch::Receiver<bool>,
}

impl DebugServer {
    pub fn new(bind_addr: SocketAddr, registry: Registry, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Debug server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = self.registry.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                    let registry = registry.clone();
                                    async move { Ok::<_, Infallible>(handle_debug_request(req, &registry)) }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Debug connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept debug connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Debug server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn handle_debug_request<B>(req: Request<B>, registry: &Registry) -> Response<ProxyBody> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                error!(error = %e, "Failed to encode metrics");
                return response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics");
            }
            let mut res = response(StatusCode::OK, buffer);
            if let Ok(value) = encoder.format_type().parse::<HeaderValue>() {
                res.headers_mut().insert(CONTENT_TYPE, value);
            }
            res
        }

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            let mut res = response(StatusCode::OK, version_info.to_string());
            res.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            res
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
