//! Listener loop shared by the HTTP and HTTPS frontends
//!
//! Every accepted connection is served on its own task with hyper's auto
//! builder (HTTP/1.1 and HTTP/2). Request bodies are boxed into
//! [`ProxyBody`] and tagged with a [`ConnectionInfo`] extension before the
//! request enters the handler chain.

use crate::acme::Http01Challenges;
use crate::body::{boxed, full, ProxyBody};
use crate::middleware::Handler;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Per-connection facts attached to every request as an extension
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Peer address of the client connection
    pub remote_addr: Option<SocketAddr>,
    /// Whether the request arrived over TLS
    pub tls: bool,
}

/// A frontend listener serving one handler chain
pub struct ProxyServer {
    bind_addr: SocketAddr,
    handler: Arc<dyn Handler>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    /// ACME HTTP-01 challenges, answered before the handler chain
    acme_challenges: Option<Http01Challenges>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, handler: Arc<dyn Handler>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            handler,
            shutdown_rx,
            tls_acceptor: None,
            acme_challenges: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn with_acme_challenges(mut self, challenges: Http01Challenges) -> Self {
        self.acme_challenges = Some(challenges);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, protocol, "Listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let acme_challenges = self.acme_challenges.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, handler, true, None).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, handler, false, acme_challenges).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %local_addr, protocol, "Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    handler: Arc<dyn Handler>,
    tls: bool,
    acme_challenges: Option<Http01Challenges>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let info = ConnectionInfo {
        remote_addr: Some(addr),
        tls,
    };

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let acme = acme_challenges.clone();
        async move {
            let mut req = req.map(boxed);
            req.extensions_mut().insert(info);
            Ok::<_, Infallible>(handle_request(req, handler, acme.as_ref()).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<ProxyBody>,
    handler: Arc<dyn Handler>,
    acme_challenges: Option<&Http01Challenges>,
) -> Response<ProxyBody> {
    if let Some(challenges) = acme_challenges {
        if req.method() == Method::GET {
            if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
                if let Some(key_auth) = challenges.get(token).await {
                    debug!(token, "Responding to ACME HTTP-01 challenge");
                    let mut response = Response::new(full(key_auth));
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                    return response;
                }
            }
        }
    }

    handler.handle(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::http01_cache_key;
    use crate::cache::{CertCache, DirBackend};
    use crate::middleware::handler_fn;
    use http_body_util::BodyExt;
    use hyper::StatusCode;

    fn echo_info() -> Arc<dyn Handler> {
        handler_fn(|req: Request<ProxyBody>| async move {
            let info = req.extensions().get::<ConnectionInfo>().copied().unwrap_or_default();
            Response::new(full(format!("tls={} remote={}", info.tls, info.remote_addr.is_some())))
        })
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn challenges() -> (Http01Challenges, Arc<CertCache>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirBackend::new(dir.path().join("cache")).await.unwrap();
        let cache = Arc::new(CertCache::new(Arc::new(backend), None, false));
        (Http01Challenges::new(Arc::clone(&cache)), cache, dir)
    }

    #[tokio::test]
    async fn test_challenge_answered_before_handler() {
        let (challenges, _cache, _dir) = challenges().await;
        challenges.set("tok123", "tok123.thumbprint").await.unwrap();

        let req = Request::builder()
            .uri("/.well-known/acme-challenge/tok123")
            .body(crate::body::empty())
            .unwrap();
        let response = handle_request(req, echo_info(), Some(&challenges)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "tok123.thumbprint");
    }

    #[tokio::test]
    async fn test_unknown_challenge_falls_through() {
        let (challenges, cache, _dir) = challenges().await;
        assert!(cache.get(&http01_cache_key("missing")).await.unwrap_err().is_not_found());

        let req = Request::builder()
            .uri("/.well-known/acme-challenge/missing")
            .body(crate::body::empty())
            .unwrap();
        let response = handle_request(req, echo_info(), Some(&challenges)).await;
        assert_eq!(body_string(response).await, "tls=false remote=false");
    }

    #[tokio::test]
    async fn test_serve_attaches_connection_info() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = ProxyServer::new(addr, echo_info(), shutdown_rx);
        let handle = tokio::spawn(server.serve(listener));

        let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
            .build_http::<http_body_util::Empty<hyper::body::Bytes>>();
        let response = client
            .get(format!("http://{}/", addr).parse().unwrap())
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"tls=false remote=true");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
