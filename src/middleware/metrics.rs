//! Prometheus request metrics
//!
//! Metrics are registered into the registry handed to [`Metrics::new`]; the
//! debug listener exposes the same registry on `/metrics`.
//!
//! The time-to-first-byte histogram is observed when the wrapped handler
//! returns the response head. Latency, size and the request counter are
//! observed once the response body has been fully sent or dropped.

use super::Handler;
use crate::body::{BoxError, ProxyBody};
use crate::router::raw_host;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::CONTENT_LENGTH;
use hyper::{Request, Response};
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

const LABELS: &[&str] = &["host", "code", "method"];
const SIZE_BUCKETS: &[f64] = &[50.0, 200.0, 500.0, 900.0, 1500.0];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Optional prefix for every metric name
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Request metrics middleware
pub struct Metrics {
    in_flight: IntGauge,
    requests_total: IntCounterVec,
    response_duration: HistogramVec,
    write_header_duration: HistogramVec,
    request_size: HistogramVec,
    response_size: HistogramVec,
}

impl Metrics {
    pub fn new(config: MetricsConfig, registry: &Registry) -> Result<Self, prometheus::Error> {
        let namespace = config.namespace.unwrap_or_default();
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(namespace.clone());
        let histogram = |name: &str, help: &str, buckets: Vec<f64>| {
            HistogramOpts::new(name, help)
                .namespace(namespace.clone())
                .buckets(buckets)
        };

        let in_flight = IntGauge::with_opts(opts(
            "in_flight_requests",
            "A gauge of requests currently being served by the wrapped handler.",
        ))?;
        let requests_total = IntCounterVec::new(
            opts("http_requests_total", "A counter for requests to the wrapped handler."),
            LABELS,
        )?;
        let response_duration = HistogramVec::new(
            histogram(
                "http_response_duration_seconds",
                "A histogram of request latencies.",
                prometheus::DEFAULT_BUCKETS.to_vec(),
            ),
            LABELS,
        )?;
        let write_header_duration = HistogramVec::new(
            histogram(
                "http_write_header_duration_seconds",
                "A histogram of time to first write latencies.",
                prometheus::DEFAULT_BUCKETS.to_vec(),
            ),
            LABELS,
        )?;
        let request_size = HistogramVec::new(
            histogram(
                "http_request_size_bytes",
                "A histogram of request sizes.",
                SIZE_BUCKETS.to_vec(),
            ),
            LABELS,
        )?;
        let response_size = HistogramVec::new(
            histogram(
                "http_response_size_bytes",
                "A histogram of response sizes.",
                SIZE_BUCKETS.to_vec(),
            ),
            LABELS,
        )?;

        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(response_duration.clone()))?;
        registry.register(Box::new(write_header_duration.clone()))?;
        registry.register(Box::new(request_size.clone()))?;
        registry.register(Box::new(response_size.clone()))?;

        Ok(Self {
            in_flight,
            requests_total,
            response_duration,
            write_header_duration,
            request_size,
            response_size,
        })
    }

    pub(crate) async fn call(&self, req: Request<ProxyBody>, next: Arc<dyn Handler>) -> Response<ProxyBody> {
        let start = Instant::now();
        let host = raw_host(&req).unwrap_or_default().to_ascii_lowercase();
        let method = req.method().to_string();
        let request_size = approximate_request_size(&req);

        let in_flight = InFlight::new(self.in_flight.clone());
        let response = next.handle(req).await;

        let code = response.status().as_u16().to_string();
        let labels = [host.as_str(), code.as_str(), method.as_str()];
        self.write_header_duration
            .with_label_values(&labels)
            .observe(start.elapsed().as_secs_f64());
        self.request_size
            .with_label_values(&labels)
            .observe(request_size as f64);

        let observer = Completion {
            start,
            requests_total: self.requests_total.with_label_values(&labels),
            response_duration: self.response_duration.with_label_values(&labels),
            response_size: self.response_size.with_label_values(&labels),
            _in_flight: in_flight,
        };

        response.map(|body| {
            MeteredBody {
                inner: body,
                written: 0,
                observer: Some(observer),
            }
            .boxed()
        })
    }
}

/// Approximate wire size of a request head plus its declared body length
fn approximate_request_size<B>(req: &Request<B>) -> usize {
    let mut size = req.method().as_str().len();
    size += req.uri().path().len();
    size += format!("{:?}", req.version()).len();

    // "Host: " plus the host itself
    size += 6;
    size += raw_host(req).map(str::len).unwrap_or(0);

    for (name, value) in req.headers() {
        // ": " between name and value
        size += name.as_str().len() + 2 + value.len();
    }

    if let Some(len) = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        size += len;
    }

    size
}

/// Decrements the in-flight gauge when dropped
struct InFlight(IntGauge);

impl InFlight {
    fn new(gauge: IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Observations made once the response body is finished
struct Completion {
    start: Instant,
    requests_total: IntCounter,
    response_duration: Histogram,
    response_size: Histogram,
    _in_flight: InFlight,
}

impl Completion {
    fn observe(self, written: u64) {
        self.response_duration.observe(self.start.elapsed().as_secs_f64());
        self.requests_total.inc();
        self.response_size.observe(written as f64);
    }
}

/// Body adapter counting the bytes handed to the client
struct MeteredBody {
    inner: ProxyBody,
    written: u64,
    observer: Option<Completion>,
}

impl MeteredBody {
    fn complete(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer.observe(self.written);
        }
    }
}

impl Body for MeteredBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        match &poll {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.written += data.len() as u64;
                }
            }
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => this.complete(),
            Poll::Pending => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        self.complete();
    }
}
