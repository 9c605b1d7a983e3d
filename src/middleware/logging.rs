//! Access logging, one structured record per request

use super::Handler;
use crate::body::ProxyBody;
use crate::proxy::ConnectionInfo;
use crate::router::raw_host;
use hyper::header::{HeaderMap, CONTENT_LENGTH, REFERER, USER_AGENT};
use hyper::{Request, Response};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// The access log takes no options
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {}

#[derive(Debug)]
pub struct Logging;

impl Logging {
    pub fn new(_config: LoggingConfig) -> Self {
        Self
    }

    pub(crate) async fn call(&self, req: Request<ProxyBody>, next: Arc<dyn Handler>) -> Response<ProxyBody> {
        let start = Instant::now();

        let host = raw_host(&req).unwrap_or_default().to_ascii_lowercase();
        let remote_addr = req
            .extensions()
            .get::<ConnectionInfo>()
            .and_then(|info| info.remote_addr)
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();
        let headers = req.headers();
        let forwarded_for = header_str(headers, "x-forwarded-for");
        let forwarded_proto = header_str(headers, "x-forwarded-proto");
        let forwarded_host = header_str(headers, "x-forwarded-host");
        let real_ip = header_str(headers, "x-real-ip");
        let referer = header_str(headers, REFERER.as_str());
        let user_agent = header_str(headers, USER_AGENT.as_str());
        let request_length: i64 = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
        let method = req.method().to_string();
        let request_uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let response = next.handle(req).await;

        info!(
            host = %host,
            remote_addr = %remote_addr,
            forwarded_for = %forwarded_for,
            forwarded_proto = %forwarded_proto,
            forwarded_host = %forwarded_host,
            real_ip = %real_ip,
            method = %method,
            request_uri = %request_uri,
            status_code = response.status().as_u16(),
            referer = %referer,
            user_agent = %user_agent,
            duration = start.elapsed().as_secs_f64(),
            request_length,
            "Request handled"
        );

        response
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}
