//! Token-usage metrics and request/response capture (spec.md §4.10).
//!
//! [`MetricsMonitor`] sits between the router and a model's proxied call:
//! it buffers the request body so it can be replayed to the downstream
//! call and, separately, captured; then it tees the response body so the
//! client sees it unmodified and in real time while a copy accumulates for
//! usage extraction and capture storage once the stream ends.

mod capture;
mod usage;

use std::collections::VecDeque;
use std::io::Read;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{Request, Response};
use parking_lot::RwLock;
use tracing::warn;

pub use capture::{redact_headers, CaptureRing, ReqRespCapture};
pub use usage::{extract_from_sse_reverse, extract_from_whole_body, UsageExtraction};

use crate::events::{Event, EventBus};

/// One recorded token-usage sample (spec.md §3.1 TokenMetric).
#[derive(Debug, Clone)]
pub struct TokenMetric {
    pub id: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub model: String,
    pub cached_tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub prompt_per_second: f64,
    pub tokens_per_second: f64,
    pub duration_ms: i64,
    pub has_capture: bool,
}

/// Tees a byte stream: every chunk that passes through is also appended to
/// an internal buffer, and once the stream ends the accumulated buffer is
/// handed to `on_complete`. All fields are `Unpin` (the inner stream is
/// boxed and pinned), so `TeeStream` needs no manual pin projection.
struct TeeStream<S, F> {
    inner: Pin<Box<S>>,
    buffer: Vec<u8>,
    on_complete: Option<F>,
}

impl<S, F> Stream for TeeStream<S, F>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
    F: FnOnce(Vec<u8>) + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.buffer.extend_from_slice(&bytes);
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                if let Some(on_complete) = self.on_complete.take() {
                    let buffer = std::mem::take(&mut self.buffer);
                    on_complete(buffer);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn decompress(body: &[u8], content_encoding: Option<&str>) -> std::io::Result<Vec<u8>> {
    match content_encoding {
        Some(enc) if enc.eq_ignore_ascii_case("gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        Some(enc) if enc.eq_ignore_ascii_case("deflate") => {
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        _ => Ok(body.to_vec()),
    }
}

/// Owns the metric history ring and the capture ring, and wraps proxied
/// requests to populate both (spec.md §4.10).
pub struct MetricsMonitor {
    next_id: AtomicU64,
    history: RwLock<VecDeque<TokenMetric>>,
    history_cap: usize,
    captures: RwLock<CaptureRing>,
    captures_enabled: bool,
    events: EventBus,
}

impl MetricsMonitor {
    pub fn new(history_cap: usize, capture_max_bytes: usize, captures_enabled: bool, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            history: RwLock::new(VecDeque::new()),
            history_cap,
            captures: RwLock::new(CaptureRing::new(capture_max_bytes)),
            captures_enabled,
            events,
        })
    }

    pub fn history_snapshot(&self) -> Vec<TokenMetric> {
        self.history.read().iter().cloned().collect()
    }

    pub fn get_metric(&self, id: u64) -> Option<TokenMetric> {
        self.history.read().iter().find(|m| m.id == id).cloned()
    }

    pub fn get_capture(&self, id: u64) -> Option<ReqRespCapture> {
        self.captures.read().get(id).cloned()
    }

    /// Wrap one proxied request/response cycle (spec.md §4.10):
    /// 1. Buffer the request body so it can be replayed to `downstream` and
    ///    (optionally) captured.
    /// 2. Run the actual proxied call.
    /// 3. For 200 responses, tee the response body: the client streams it
    ///    unmodified while a background task extracts usage and stores a
    ///    capture once the stream completes. Non-200 responses pass
    ///    through untouched and record no metric.
    pub async fn wrap_request<F, Fut, E>(
        self: &Arc<Self>,
        model_id: &str,
        req: Request<Body>,
        downstream: F,
    ) -> Result<Response<Body>, E>
    where
        F: FnOnce(Request<Body>) -> Fut,
        Fut: std::future::Future<Output = Result<Response<Body>, E>>,
    {
        let started = std::time::Instant::now();
        let (parts, body) = req.into_parts();
        let req_path = parts.uri.path().to_string();

        let req_body_bytes = match http_body_util::BodyExt::collect(body).await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };

        let req_headers_redacted = self.captures_enabled.then(|| redact_headers(&parts.headers));

        let rebuilt = Request::from_parts(parts, Body::from(req_body_bytes.clone()));
        let response = downstream(rebuilt).await?;

        if response.status().as_u16() != 200 {
            return Ok(response);
        }

        let (resp_parts, resp_body) = response.into_parts();
        let resp_headers_redacted = self.captures_enabled.then(|| redact_headers(&resp_parts.headers));
        let content_encoding = resp_parts
            .headers
            .get(http::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = resp_parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let monitor = Arc::clone(self);
        let model_id_owned = model_id.to_string();

        let on_complete = move |buffer: Vec<u8>| {
            let elapsed_ms = started.elapsed().as_millis() as i64;
            tokio::spawn(async move {
                monitor.finalize(
                    model_id_owned,
                    req_path,
                    req_body_bytes,
                    req_headers_redacted,
                    resp_headers_redacted,
                    content_encoding,
                    content_type,
                    buffer,
                    elapsed_ms,
                );
            });
        };

        let data_stream = resp_body
            .into_data_stream()
            .map(|item| item.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let teed = TeeStream {
            inner: Box::pin(data_stream),
            buffer: Vec::new(),
            on_complete: Some(on_complete),
        };

        let mut builder = Response::builder().status(resp_parts.status);
        for (name, value) in resp_parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let new_response = builder
            .body(Body::from_stream(teed))
            .unwrap_or_else(|_| Response::new(Body::empty()));
        Ok(new_response)
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        self: Arc<Self>,
        model_id: String,
        req_path: String,
        req_body: Bytes,
        req_headers_redacted: Option<std::collections::HashMap<String, String>>,
        resp_headers_redacted: Option<std::collections::HashMap<String, String>>,
        content_encoding: Option<String>,
        content_type: Option<String>,
        resp_body_raw: Vec<u8>,
        elapsed_ms: i64,
    ) {
        let decoded = match decompress(&resp_body_raw, content_encoding.as_deref()) {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!(model = %model_id, "failed to decompress response body for metrics, recording minimal entry");
                self.record_minimal(&model_id, elapsed_ms);
                return;
            }
        };

        let is_sse = content_type.as_deref().is_some_and(|ct| ct.contains("text/event-stream"));
        let is_infill = req_path.contains("/infill");

        let extraction = if is_sse {
            usage::extract_from_sse_reverse(&decoded)
        } else {
            usage::extract_from_whole_body(&decoded, is_infill)
        }
        .unwrap_or_default();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let has_capture = match (req_headers_redacted, resp_headers_redacted) {
            (Some(req_headers), Some(resp_headers)) if self.captures_enabled => {
                let capture = ReqRespCapture {
                    id,
                    req_path,
                    req_headers,
                    req_body: req_body.to_vec(),
                    resp_headers,
                    resp_body: decoded,
                };
                self.captures.write().insert(capture)
            }
            _ => false,
        };

        let duration_ms = if extraction.duration_ms != 0 {
            extraction.duration_ms
        } else {
            elapsed_ms
        };

        self.record(TokenMetric {
            id,
            timestamp: chrono::Utc::now(),
            model: model_id,
            cached_tokens: extraction.cached_tokens,
            input_tokens: extraction.input_tokens,
            output_tokens: extraction.output_tokens,
            prompt_per_second: extraction.prompt_per_second,
            tokens_per_second: extraction.tokens_per_second,
            duration_ms,
            has_capture,
        });
    }

    fn record_minimal(self: &Arc<Self>, model_id: &str, elapsed_ms: i64) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(TokenMetric {
            id,
            timestamp: chrono::Utc::now(),
            model: model_id.to_string(),
            cached_tokens: -1,
            input_tokens: 0,
            output_tokens: 0,
            prompt_per_second: -1.0,
            tokens_per_second: -1.0,
            duration_ms: elapsed_ms,
            has_capture: false,
        });
    }

    fn record(self: &Arc<Self>, metric: TokenMetric) {
        {
            let mut history = self.history.write();
            history.push_back(metric.clone());
            while history.len() > self.history_cap {
                history.pop_front();
            }
        }
        self.events.publish(Event::TokenMetrics {
            metric_id: metric.id,
            model_id: metric.model,
            input_tokens: metric.input_tokens,
            output_tokens: metric.output_tokens,
        });
    }
}
