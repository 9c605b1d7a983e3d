//! Host-based routing and backend forwarding
//!
//! The [`Router`] owns the hostname table. For every request it resolves
//! the route, applies the route's plaintext policy and authenticator, and
//! forwards what is left to the route's backend through the shared
//! [`ConnectionPool`].

use crate::auth::{new_authenticator, AuthError, Authenticator};
use crate::body::{empty, ProxyBody};
use crate::config::{ServiceConfig, ServiceEntry};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::middleware::{Handler, HandlerFuture};
use crate::pool::ConnectionPool;
use crate::proxy::ConnectionInfo;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, LOCATION};
use hyper::http::uri::{PathAndQuery, Scheme};
use hyper::{Request, Response, StatusCode, Uri, Version};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Value of the `X-Proxy-App` header sent to every backend
pub const PROXY_APP: &str = "svcgate";

/// Address used in forwarding headers when the caller's address is unknown
const UNKNOWN_REMOTE_IP: &str = "0.0.0.0";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";
const X_PROXY_APP: &str = "x-proxy-app";

/// Headers that only describe a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid backend URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported backend scheme {0:?}, only http is supported")]
    UnsupportedScheme(String),
    #[error("unknown http handler {0:?}")]
    UnknownPolicy(String),
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// What to do with a request that arrived without TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaintextPolicy {
    /// Serve it like any other request
    #[default]
    Proxy,
    /// 302 to the https:// equivalent
    Redirect,
    /// 404, as if the host were unknown
    Reject,
}

impl FromStr for PlaintextPolicy {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "proxy" => Ok(Self::Proxy),
            "redirect" => Ok(Self::Redirect),
            "reject" => Ok(Self::Reject),
            other => Err(RouteError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Upstream base URL a route forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    authority: String,
    base_path: String,
    query: String,
    rewrite_host: bool,
}

impl BackendTarget {
    /// Parse an `http://host[:port][/base][?query]` URL
    pub fn parse(url: &str, rewrite_host: bool) -> Result<Self, RouteError> {
        let invalid = |reason: String| RouteError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        let uri: Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| invalid(e.to_string()))?;
        match uri.scheme() {
            Some(scheme) if *scheme == Scheme::HTTP => {}
            Some(scheme) => return Err(RouteError::UnsupportedScheme(scheme.to_string())),
            None => return Err(invalid("missing scheme".to_string())),
        }
        let authority = uri
            .authority()
            .ok_or_else(|| invalid("missing host".to_string()))?
            .to_string();

        Ok(Self {
            authority,
            base_path: uri.path().to_string(),
            query: uri.query().unwrap_or("").to_string(),
            rewrite_host,
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Rewrite a request URI to point at this backend
    pub fn rewrite_uri(&self, uri: &Uri) -> Result<Uri, hyper::http::Error> {
        let path = single_joining_slash(&self.base_path, uri.path());
        let query = merge_query(&self.query, uri.query().unwrap_or(""));
        let path_and_query = if query.is_empty() {
            path
        } else {
            format!("{}?{}", path, query)
        };

        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.as_str())
            .path_and_query(PathAndQuery::try_from(path_and_query)?)
            .build()
    }
}

/// Join two path segments with exactly one slash at the boundary
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// The backend's fixed query first, the request's appended
fn merge_query(backend: &str, request: &str) -> String {
    if backend.is_empty() || request.is_empty() {
        format!("{}{}", backend, request)
    } else {
        format!("{}&{}", backend, request)
    }
}

/// The Host of a request as sent by the client, falling back to the URI authority
pub fn raw_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

/// Drop a `:port` suffix, keeping IPv6 brackets
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, _)) if !name.contains(':') => name,
        _ => host,
    }
}

/// Lowercased request host without port, the routing key
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    raw_host(req).map(|h| strip_port(h).to_ascii_lowercase())
}

fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, RouteError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let invalid = |reason: String| RouteError::InvalidHeader {
            name: name.clone(),
            reason,
        };
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// One hostname and everything needed to serve it
pub struct Route {
    pub hostname: String,
    pub policy: PlaintextPolicy,
    pub response_headers: HeaderMap,
    pub backend: BackendTarget,
    pub request_headers: HeaderMap,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("hostname", &self.hostname)
            .field("policy", &self.policy)
            .field("backend", &self.backend)
            .field("authenticated", &self.authenticator.is_some())
            .finish()
    }
}

impl Route {
    /// Build the route for `hostname` from its service definition
    pub fn from_service(hostname: &str, service: &ServiceConfig) -> Result<Self, RouteError> {
        let policy: PlaintextPolicy = service.frontend.http_handler.parse()?;
        let response_headers = header_map(&service.frontend.response_headers)?;
        let authenticator =
            new_authenticator(&service.authentication.method, &service.authentication.options)?;
        let backend = BackendTarget::parse(&service.backend.url, service.backend.rewrite_host)?;
        let request_headers = header_map(&service.backend.request_headers)?;

        Ok(Self {
            hostname: hostname.to_ascii_lowercase(),
            policy,
            response_headers,
            backend,
            request_headers,
            authenticator: Some(authenticator),
        })
    }
}

/// Hostname table plus the shared backend transport
pub struct Router {
    routes: HashMap<String, Arc<Route>>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl Router {
    pub fn new(pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            pool,
            request_timeout,
        }
    }

    /// Build a router from service definitions, skipping services and routes that fail to build
    pub fn from_services(services: &[ServiceEntry], pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        let mut router = Self::new(pool, request_timeout);
        for entry in services {
            let service = match entry {
                ServiceEntry::Valid(service) => service,
                ServiceEntry::Invalid { fqdn, reason } => {
                    warn!(hostnames = ?fqdn, error = %reason, "Invalid service definition, skipping");
                    continue;
                }
            };
            for fqdn in &service.frontend.fqdn {
                match Route::from_service(fqdn, service) {
                    Ok(route) => router.add_route(route),
                    Err(e) => {
                        warn!(hostname = %fqdn, error = %e, "Unable to initialize route, skipping");
                    }
                }
            }
        }
        router
    }

    /// Register a route; a later route for the same hostname replaces the earlier one
    pub fn add_route(&mut self, route: Route) {
        let hostname = route.hostname.to_ascii_lowercase();
        if self.routes.contains_key(&hostname) {
            warn!(hostname = %hostname, "Duplicate route for hostname, replacing previous definition");
        }
        debug!(hostname = %hostname, backend = %route.backend.authority(), "Route registered");
        self.routes.insert(hostname, Arc::new(route));
    }

    /// Registered hostnames, sorted
    pub fn hostnames(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.routes.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn route(&self, hostname: &str) -> Option<Arc<Route>> {
        self.routes.get(&hostname.to_ascii_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Produce the response for one request
    pub async fn dispatch(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let Some(route) = request_host(&req).and_then(|host| self.route(&host)) else {
            return unknown_host();
        };

        let mut response = self.dispatch_route(&route, req).await;
        for (name, value) in &route.response_headers {
            response.headers_mut().insert(name, value.clone());
        }
        response
    }

    async fn dispatch_route(&self, route: &Route, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let tls = req
            .extensions()
            .get::<ConnectionInfo>()
            .map(|info| info.tls)
            .unwrap_or(false);

        if !tls {
            match route.policy {
                PlaintextPolicy::Reject => return unknown_host(),
                PlaintextPolicy::Redirect => return https_redirect(&req),
                PlaintextPolicy::Proxy => {}
            }
        }

        if let Some(authenticator) = &route.authenticator {
            if !authenticator.is_authenticated(&req).await {
                debug!(hostname = %route.hostname, "Request not authenticated");
                let mut response = Response::new(empty());
                authenticator.authenticate(&req, &mut response);
                return response;
            }
        }

        self.forward(route, req).await
    }

    async fn forward(&self, route: &Route, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let remote_ip = req
            .extensions()
            .get::<ConnectionInfo>()
            .and_then(|info| info.remote_addr)
            .map(|addr| addr.ip().to_canonical().to_string())
            .unwrap_or_else(|| UNKNOWN_REMOTE_IP.to_string());
        let original_host = raw_host(&req).map(str::to_string);

        let (mut parts, body) = req.into_parts();
        parts.uri = match route.backend.rewrite_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                error!(hostname = %route.hostname, error = %e, "Failed to build backend URI");
                return json_error_response(ProxyErrorCode::InternalError, "Failed to build backend request");
            }
        };
        parts.version = Version::HTTP_11;

        let headers = &mut parts.headers;
        remove_hop_by_hop(headers);

        // HTTP/2 clients carry the host in the URI only
        if !headers.contains_key(HOST) {
            if let Some(value) = original_host.and_then(|h| HeaderValue::from_str(&h).ok()) {
                headers.insert(HOST, value);
            }
        }
        if route.backend.rewrite_host {
            if let Ok(value) = HeaderValue::from_str(route.backend.authority()) {
                headers.insert(HOST, value);
            }
        }

        if let Ok(value) = HeaderValue::from_str(&remote_ip) {
            headers.insert(X_FORWARDED_FOR, value.clone());
            headers.insert(X_REAL_IP, value);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        headers.insert(X_PROXY_APP, HeaderValue::from_static(PROXY_APP));

        for (name, value) in &route.request_headers {
            headers.insert(name, value.clone());
        }

        let backend_req = Request::from_parts(parts, body);
        match tokio::time::timeout(self.request_timeout, self.pool.send_request(backend_req)).await {
            Ok(Ok(mut response)) => {
                remove_hop_by_hop(response.headers_mut());
                response
            }
            Ok(Err(e)) => {
                error!(
                    hostname = %route.hostname,
                    backend = %route.backend.authority(),
                    error = %e,
                    "Failed to forward request"
                );
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
            Err(_) => {
                warn!(
                    hostname = %route.hostname,
                    backend = %route.backend.authority(),
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", self.request_timeout.as_secs()),
                )
            }
        }
    }
}

impl Handler for Router {
    fn handle(self: Arc<Self>, req: Request<ProxyBody>) -> HandlerFuture {
        Box::pin(async move { self.dispatch(req).await })
    }
}

fn unknown_host() -> Response<ProxyBody> {
    json_error_response(ProxyErrorCode::UnknownHost, "Unknown or unconfigured host")
}

/// 302 to the https:// equivalent of the request, path and query untouched
fn https_redirect<B>(req: &Request<B>) -> Response<ProxyBody> {
    let Some(host) = raw_host(req).map(strip_port) else {
        return json_error_response(ProxyErrorCode::InvalidRedirect, "Missing Host header");
    };
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = match format!("https://{}{}", host, path).parse::<Uri>() {
        Ok(uri) => uri.to_string(),
        Err(_) => {
            return json_error_response(ProxyErrorCode::InvalidRedirect, "Cannot build redirect target");
        }
    };

    let Ok(value) = HeaderValue::from_str(&location) else {
        return json_error_response(ProxyErrorCode::InvalidRedirect, "Cannot build redirect target");
    };
    debug!(location = %location, "Redirecting plaintext request");

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(LOCATION, value);
    response
}

/// Remove connection-scoped headers, including any named by `Connection`
fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
