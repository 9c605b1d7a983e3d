//! On-the-fly gzip compression of response bodies

use super::Handler;
use crate::body::{BoxError, ProxyBody};
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, VARY};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

/// `level = -1` selects the library default, 0 stores, 9 compresses hardest
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GzipConfig {
    pub level: i32,
}

/// Gzip compression middleware
#[derive(Debug)]
pub struct Gzip {
    level: Compression,
}

impl Gzip {
    pub fn new(config: GzipConfig) -> Result<Self, String> {
        let level = match config.level {
            -1 => Compression::default(),
            0..=9 => Compression::new(config.level as u32),
            other => {
                return Err(format!(
                    "invalid compression level: {}. Must be between -1 and 9",
                    other
                ))
            }
        };
        Ok(Self { level })
    }

    pub(crate) async fn call(&self, req: Request<ProxyBody>, next: Arc<dyn Handler>) -> Response<ProxyBody> {
        let accepts_gzip = accepts_gzip(req.headers());
        let is_head = req.method() == Method::HEAD;

        let response = next.handle(req).await;
        if !accepts_gzip || is_head || !has_body(response.status()) {
            return response;
        }
        if response.headers().contains_key(CONTENT_ENCODING) {
            return response;
        }

        let (mut parts, body) = response.into_parts();
        parts
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        parts.headers.remove(CONTENT_LENGTH);
        parts
            .headers
            .append(VARY, HeaderValue::from_static("Accept-Encoding"));

        Response::from_parts(parts, GzipBody::new(body, self.level).boxed())
    }
}

fn has_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

/// Whether `Accept-Encoding` lists gzip with a non-zero quality
fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|item| {
            let mut params = item.split(';');
            let coding = params.next().unwrap_or("").trim();
            if !coding.eq_ignore_ascii_case("gzip") && coding != "*" {
                return false;
            }
            !params.any(|p| {
                let p = p.trim();
                p.strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            })
        })
}

/// Body adapter compressing every data frame of the inner body
pub struct GzipBody {
    inner: ProxyBody,
    encoder: Option<GzEncoder<Vec<u8>>>,
    trailers: Option<HeaderMap>,
}

impl GzipBody {
    pub fn new(inner: ProxyBody, level: Compression) -> Self {
        Self {
            inner,
            encoder: Some(GzEncoder::new(Vec::new(), level)),
            trailers: None,
        }
    }

    /// Finish the gzip stream, returning the remaining compressed bytes
    fn finish(&mut self) -> Result<Option<Bytes>, BoxError> {
        match self.encoder.take() {
            Some(encoder) => {
                let tail = encoder.finish()?;
                Ok((!tail.is_empty()).then(|| Bytes::from(tail)))
            }
            None => Ok(None),
        }
    }
}

impl Body for GzipBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        loop {
            if this.encoder.is_none() {
                return Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        let Some(encoder) = this.encoder.as_mut() else {
                            continue;
                        };
                        if let Err(e) = encoder.write_all(&data) {
                            return Poll::Ready(Some(Err(e.into())));
                        }
                        let compressed = std::mem::take(encoder.get_mut());
                        if !compressed.is_empty() {
                            return Poll::Ready(Some(Ok(Frame::data(Bytes::from(compressed)))));
                        }
                    }
                    Err(frame) => {
                        // Trailers end the body; flush the gzip footer before them
                        this.trailers = frame.into_trailers().ok();
                        match this.finish() {
                            Ok(Some(tail)) => return Poll::Ready(Some(Ok(Frame::data(tail)))),
                            Ok(None) => continue,
                            Err(e) => return Poll::Ready(Some(Err(e))),
                        }
                    }
                },
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => match this.finish() {
                    Ok(Some(tail)) => return Poll::Ready(Some(Ok(Frame::data(tail)))),
                    Ok(None) => continue,
                    Err(e) => return Poll::Ready(Some(Err(e))),
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.encoder.is_none() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::full;
    use crate::middleware::handler_fn;
    use http_body_util::BodyExt;
    use std::io::Read;

    fn gzip(level: i32) -> Gzip {
        Gzip::new(GzipConfig { level }).unwrap()
    }

    fn request(accept_encoding: Option<&str>) -> Request<ProxyBody> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = accept_encoding {
            builder = builder.header(ACCEPT_ENCODING, value);
        }
        builder.body(crate::body::empty()).unwrap()
    }

    fn backend(body: impl Into<String>) -> Arc<dyn Handler> {
        let body: String = body.into();
        handler_fn(move |_req| {
            let body = body.clone();
            async move {
                let len = body.len();
                let mut response = Response::new(full(body));
                response
                    .headers_mut()
                    .insert(CONTENT_LENGTH, HeaderValue::from(len));
                response
            }
        })
    }

    fn gunzip(data: &[u8]) -> String {
        let mut out = String::new();
        flate2::read::GzDecoder::new(data).read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_level_validation() {
        for level in [-1, 0, 5, 9] {
            assert!(Gzip::new(GzipConfig { level }).is_ok(), "level {}", level);
        }
        for level in [-3, -2, 10, 42] {
            assert!(Gzip::new(GzipConfig { level }).is_err(), "level {}", level);
        }
    }

    #[test]
    fn test_accepts_gzip() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("deflate, gzip;q=0.8"));
        assert!(accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("GZIP"));
        assert!(accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip;q=0"));
        assert!(!accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("br, deflate"));
        assert!(!accepts_gzip(&headers));
    }

    #[tokio::test]
    async fn test_compresses_when_accepted() {
        let body = "The quick brown fox jumps over the lazy dog. ".repeat(50);

        let response = gzip(6).call(request(Some("gzip")), backend(body.clone())).await;
        assert_eq!(response.headers().get(CONTENT_ENCODING).unwrap(), "gzip");
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(response.headers().get(VARY).unwrap(), "Accept-Encoding");

        let compressed = response.into_body().collect().await.unwrap().to_bytes();
        assert!(compressed.len() < body.len());
        assert_eq!(gunzip(&compressed), body);
    }

    #[tokio::test]
    async fn test_untouched_without_accept_encoding() {
        let response = gzip(6).call(request(None), backend("plain body")).await;
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "10");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"plain body");
    }

    #[tokio::test]
    async fn test_already_encoded_response_passes_through() {
        let next = handler_fn(|_req| async {
            let mut response = Response::new(full("br-bytes"));
            response
                .headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
            response
        });
        let response = gzip(6).call(request(Some("gzip, br")), next).await;
        assert_eq!(response.headers().get(CONTENT_ENCODING).unwrap(), "br");
    }

    #[tokio::test]
    async fn test_streaming_body_with_empty_input() {
        let response = gzip(1).call(request(Some("gzip")), backend("")).await;
        let compressed = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(gunzip(&compressed), "");
    }

    #[tokio::test]
    async fn test_multi_frame_body_and_trailers() {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"first chunk, "))),
            Ok(Frame::data(Bytes::from_static(b"second chunk"))),
            Ok(Frame::trailers({
                let mut t = HeaderMap::new();
                t.insert("x-checksum", HeaderValue::from_static("abc"));
                t
            })),
        ];
        let inner = frames_body(frames).boxed();

        let collected = GzipBody::new(inner, Compression::new(6)).collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap().get("x-checksum").unwrap(), "abc");
        assert_eq!(gunzip(&collected.to_bytes()), "first chunk, second chunk");
    }

    /// Body yielding a fixed list of frames
    fn frames_body(
        frames: Vec<Result<Frame<Bytes>, BoxError>>,
    ) -> impl hyper::body::Body<Data = Bytes, Error = BoxError> + Send + Sync + 'static {
        struct Frames(std::collections::VecDeque<Result<Frame<Bytes>, BoxError>>);
        impl Body for Frames {
            type Data = Bytes;
            type Error = BoxError;
            fn poll_frame(
                mut self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
                Poll::Ready(self.0.pop_front())
            }
        }
        Frames(frames.into())
    }
}
