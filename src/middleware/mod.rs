//! Listener middleware chain
//!
//! Middleware is configured per listener as an ordered list of
//! `{ name = "...", ...options }` tables. Names are resolved once, when the
//! chain is built; after that the chain is a stack of [`Middleware`] values
//! wrapped around the base handler.
//!
//! The first configured entry is the outermost layer: it sees the request
//! first and the response last.

pub mod filter;
pub mod gzip;
pub mod logging;
pub mod metrics;

use crate::body::ProxyBody;
use hyper::{Request, Response};
use prometheus::Registry;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use filter::{Filter, FilterConfig};
pub use gzip::{Gzip, GzipConfig};
pub use logging::{Logging, LoggingConfig};
pub use metrics::{Metrics, MetricsConfig};

/// Future returned by a [`Handler`]
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<ProxyBody>> + Send>>;

/// Something that turns a request into exactly one response
pub trait Handler: Send + Sync + 'static {
    fn handle(self: Arc<Self>, req: Request<ProxyBody>) -> HandlerFuture;
}

/// Adapts an async closure into a [`Handler`]
pub struct HandlerFn<F>(F);

/// Build a [`Handler`] from an async function
pub fn handler_fn<F, Fut>(f: F) -> Arc<HandlerFn<F>>
where
    F: Fn(Request<ProxyBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request<ProxyBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    fn handle(self: Arc<Self>, req: Request<ProxyBody>) -> HandlerFuture {
        Box::pin((self.0)(req))
    }
}

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("unknown middleware: {0:?}")]
    UnknownMiddleware(String),
    #[error("middleware entry has no name")]
    MissingName,
    #[error("invalid options for middleware {name:?}: {reason}")]
    InvalidOptions { name: &'static str, reason: String },
}

/// One `[[listener.middlewares]]` entry as written in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct MiddlewareSpec {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

/// The built-in middleware kinds, looked up by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareKind {
    Filter,
    Gzip,
    Logging,
    Metrics,
}

impl MiddlewareKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "filter" => Some(Self::Filter),
            "gzip" => Some(Self::Gzip),
            "logging" => Some(Self::Logging),
            "metrics" => Some(Self::Metrics),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Gzip => "gzip",
            Self::Logging => "logging",
            Self::Metrics => "metrics",
        }
    }

    /// Decode `options` into this kind's typed configuration and build it
    pub fn build(self, options: toml::Table, registry: &Registry) -> Result<Middleware, MiddlewareError> {
        let name = self.name();
        let invalid = |reason: String| MiddlewareError::InvalidOptions { name, reason };

        match self {
            Self::Filter => {
                let config: FilterConfig = decode(name, options)?;
                Ok(Middleware::Filter(Filter::new(config).map_err(invalid)?))
            }
            Self::Gzip => {
                let config: GzipConfig = decode(name, options)?;
                Ok(Middleware::Gzip(Gzip::new(config).map_err(invalid)?))
            }
            Self::Logging => {
                let config: LoggingConfig = decode(name, options)?;
                Ok(Middleware::Logging(Logging::new(config)))
            }
            Self::Metrics => {
                let config: MetricsConfig = decode(name, options)?;
                let metrics = Metrics::new(config, registry).map_err(|e| invalid(e.to_string()))?;
                Ok(Middleware::Metrics(metrics))
            }
        }
    }
}

fn decode<T: DeserializeOwned>(name: &'static str, options: toml::Table) -> Result<T, MiddlewareError> {
    toml::Value::Table(options)
        .try_into()
        .map_err(|e: toml::de::Error| MiddlewareError::InvalidOptions {
            name,
            reason: e.message().to_string(),
        })
}

/// A configured middleware instance
pub enum Middleware {
    Filter(Filter),
    Gzip(Gzip),
    Logging(Logging),
    Metrics(Metrics),
}

impl Middleware {
    pub fn kind(&self) -> MiddlewareKind {
        match self {
            Middleware::Filter(_) => MiddlewareKind::Filter,
            Middleware::Gzip(_) => MiddlewareKind::Gzip,
            Middleware::Logging(_) => MiddlewareKind::Logging,
            Middleware::Metrics(_) => MiddlewareKind::Metrics,
        }
    }

    async fn call(&self, req: Request<ProxyBody>, next: Arc<dyn Handler>) -> Response<ProxyBody> {
        match self {
            Middleware::Filter(m) => m.call(req, next).await,
            Middleware::Gzip(m) => m.call(req, next).await,
            Middleware::Logging(m) => m.call(req, next).await,
            Middleware::Metrics(m) => m.call(req, next).await,
        }
    }
}

/// A middleware wrapped around the rest of the chain
struct Layer {
    middleware: Middleware,
    next: Arc<dyn Handler>,
}

impl Handler for Layer {
    fn handle(self: Arc<Self>, req: Request<ProxyBody>) -> HandlerFuture {
        Box::pin(async move {
            let next = Arc::clone(&self.next);
            self.middleware.call(req, next).await
        })
    }
}

/// Wrap `base` with the configured middleware, first entry outermost
pub fn build_chain(
    base: Arc<dyn Handler>,
    specs: &[MiddlewareSpec],
    registry: &Registry,
) -> Result<Arc<dyn Handler>, MiddlewareError> {
    let mut middlewares = Vec::with_capacity(specs.len());
    for spec in specs {
        if spec.name.is_empty() {
            return Err(MiddlewareError::MissingName);
        }
        let kind = MiddlewareKind::from_name(&spec.name)
            .ok_or_else(|| MiddlewareError::UnknownMiddleware(spec.name.clone()))?;
        middlewares.push(kind.build(spec.options.clone(), registry)?);
    }

    let mut handler = base;
    for middleware in middlewares.into_iter().rev() {
        debug!(middleware = middleware.kind().name(), "Adding middleware to chain");
        handler = Arc::new(Layer {
            middleware,
            next: handler,
        });
    }
    Ok(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::full;
    use crate::proxy::ConnectionInfo;
    use http_body_util::BodyExt;
    use hyper::StatusCode;
    use std::io::Read;

    fn specs(toml_str: &str) -> Vec<MiddlewareSpec> {
        #[derive(Deserialize)]
        struct Wrapper {
            middlewares: Vec<MiddlewareSpec>,
        }
        toml::from_str::<Wrapper>(toml_str).unwrap().middlewares
    }

    fn ok_handler() -> Arc<dyn Handler> {
        handler_fn(|_req| async { Response::new(full("hello from the backend")) })
    }

    fn request_from(ip: &str) -> Request<ProxyBody> {
        let mut req = Request::builder()
            .uri("/")
            .header("accept-encoding", "gzip, deflate")
            .body(crate::body::empty())
            .unwrap();
        req.extensions_mut().insert(ConnectionInfo {
            remote_addr: Some(format!("{}:40000", ip).parse().unwrap()),
            tls: true,
        });
        req
    }

    async fn body_of(response: Response<ProxyBody>) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[test]
    fn test_spec_parsing_keeps_options() {
        let parsed = specs(
            r#"
            [[middlewares]]
            name = "gzip"
            level = 6

            [[middlewares]]
            name = "logging"
            "#,
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "gzip");
        assert_eq!(parsed[0].options.get("level").and_then(|v| v.as_integer()), Some(6));
        assert!(!parsed[0].options.contains_key("name"));
        assert!(parsed[1].options.is_empty());
    }

    #[test]
    fn test_unknown_middleware_is_error() {
        let registry = Registry::new();
        let result = build_chain(ok_handler(), &specs("[[middlewares]]\nname = \"cors\""), &registry);
        assert!(matches!(result, Err(MiddlewareError::UnknownMiddleware(name)) if name == "cors"));
    }

    #[test]
    fn test_missing_name_is_error() {
        let registry = Registry::new();
        let result = build_chain(ok_handler(), &specs("[[middlewares]]\nlevel = 1"), &registry);
        assert!(matches!(result, Err(MiddlewareError::MissingName)));
    }

    #[test]
    fn test_invalid_options_name_the_middleware() {
        let registry = Registry::new();
        for (config, expected) in [
            ("[[middlewares]]\nname = \"gzip\"\nlevel = 42", "gzip"),
            ("[[middlewares]]\nname = \"gzip\"", "gzip"),
            ("[[middlewares]]\nname = \"gzip\"\nlevel = -5", "gzip"),
            ("[[middlewares]]\nname = \"logging\"\nverbose = true", "logging"),
            (
                "[[middlewares]]\nname = \"filter\"\n[[middlewares.rules]]\ndenyFrom = [\"not-a-cidr\"]",
                "filter",
            ),
        ] {
            let result = build_chain(ok_handler(), &specs(config), &registry);
            assert!(
                matches!(result, Err(MiddlewareError::InvalidOptions { name, .. }) if name == expected),
                "config {:?}",
                config
            );
        }
    }

    #[test]
    fn test_empty_chain_returns_base() {
        let registry = Registry::new();
        assert!(build_chain(ok_handler(), &[], &registry).is_ok());
    }

    #[tokio::test]
    async fn test_first_entry_is_outermost() {
        let registry = Registry::new();

        // gzip outside the filter: the filter's 503 gets compressed
        let chain = build_chain(
            ok_handler(),
            &specs(
                r#"
                [[middlewares]]
                name = "gzip"
                level = 6

                [[middlewares]]
                name = "filter"
                [[middlewares.rules]]
                denyFrom = ["127.0.0.2/32"]
                "#,
            ),
            &registry,
        )
        .unwrap();
        let response = chain.handle(request_from("127.0.0.2")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");

        // filter outside gzip: the request never reaches the compressor
        let chain = build_chain(
            ok_handler(),
            &specs(
                r#"
                [[middlewares]]
                name = "filter"
                [[middlewares.rules]]
                denyFrom = ["127.0.0.2/32"]

                [[middlewares]]
                name = "gzip"
                level = 6
                "#,
            ),
            &registry,
        )
        .unwrap();
        let response = chain.handle(request_from("127.0.0.2")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_full_chain_passes_allowed_requests() {
        let registry = Registry::new();
        let chain = build_chain(
            ok_handler(),
            &specs(
                r#"
                [[middlewares]]
                name = "metrics"

                [[middlewares]]
                name = "logging"

                [[middlewares]]
                name = "filter"
                [[middlewares.rules]]
                denyFrom = ["127.0.0.2/32"]

                [[middlewares]]
                name = "gzip"
                level = 9
                "#,
            ),
            &registry,
        )
        .unwrap();

        let response = chain.handle(request_from("127.0.0.1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");

        let compressed = body_of(response).await;
        let mut decoded = String::new();
        flate2::read::GzDecoder::new(&compressed[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "hello from the backend");

        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "http_requests_total"));
    }
}
