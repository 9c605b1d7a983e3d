//! Body type shared by the router, the middleware chain and the backend pool
//!
//! Every handler in the gateway speaks `Request<ProxyBody>` / `Response<ProxyBody>`.
//! Incoming hyper bodies are boxed once at the connection boundary.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Bytes};

/// Boxed error carried by proxied bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type flowing through the gateway
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// A complete in-memory body
pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// An empty body
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Box any body whose error converts into [`BoxError`]
pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}
