//! Admin endpoints: raw/streamed logs, metric history, and capture lookup
//! (spec.md §6.1, §4.3, §4.10).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, Stream, StreamExt};
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;

use crate::manager::Manager;

/// `GET /logs` (spec.md §4.3): the whole history ring as one plain-text body.
pub async fn logs_text(State(manager): State<Arc<Manager>>) -> Response {
    let history = manager.shared_log().history();
    (
        StatusCode::OK,
        [(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        history,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct LogStreamQuery {
    /// Presence of the key is the flag; llama-swap-style bare query flags
    /// (`?no-history`) carry no value, so this is `Option` rather than
    /// `bool` to tolerate an empty string.
    #[serde(rename = "no-history", default)]
    no_history: Option<String>,
}

impl LogStreamQuery {
    fn skip_history(&self) -> bool {
        self.no_history.is_some()
    }
}

/// `GET /logs/streamSSE` (spec.md §4.3): replays the history ring as one
/// event unless `?no-history` is set, then forwards every subsequent write
/// as it arrives. A lagged subscriber (spec.md: "silently falls behind")
/// just skips the events it missed rather than erroring the stream.
pub async fn logs_stream_sse(
    State(manager): State<Arc<Manager>>,
    Query(query): Query<LogStreamQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let log = manager.shared_log();

    let history_event = (!query.skip_history()).then(|| {
        let snapshot = log.history();
        SseEvent::default().event("history").data(String::from_utf8_lossy(&snapshot).into_owned())
    });

    let live = BroadcastStream::new(log.subscribe()).filter_map(|item| async move {
        match item {
            Ok(chunk) => Some(Ok(SseEvent::default().event("log").data(String::from_utf8_lossy(&chunk).into_owned()))),
            Err(_lagged) => None,
        }
    });

    let combined = stream::iter(history_event.map(Ok)).chain(live);
    Sse::new(combined).keep_alive(KeepAlive::default())
}

/// `GET /metrics/history` (spec.md §4.10): the in-memory token-metric ring.
pub async fn metrics_history(State(manager): State<Arc<Manager>>) -> Response {
    let history: Vec<_> = manager
        .metrics()
        .history_snapshot()
        .into_iter()
        .map(|metric| {
            json!({
                "id": metric.id,
                "timestamp": metric.timestamp.to_rfc3339(),
                "model": metric.model,
                "cachedTokens": metric.cached_tokens,
                "inputTokens": metric.input_tokens,
                "outputTokens": metric.output_tokens,
                "promptPerSecond": metric.prompt_per_second,
                "tokensPerSecond": metric.tokens_per_second,
                "durationMs": metric.duration_ms,
                "hasCapture": metric.has_capture,
            })
        })
        .collect();
    axum::Json(history).into_response()
}

/// `GET /metrics/capture/:id` (spec.md §4.10): a stored request/response
/// pair by its metric ID, or 404 if it was never captured or has since been
/// evicted from the ring.
pub async fn get_capture(State(manager): State<Arc<Manager>>, Path(id): Path<u64>) -> Response {
    match manager.metrics().get_capture(id) {
        Some(capture) => axum::Json(json!({
            "id": capture.id,
            "requestPath": capture.req_path,
            "requestHeaders": capture.req_headers,
            "requestBody": String::from_utf8_lossy(&capture.req_body),
            "responseHeaders": capture.resp_headers,
            "responseBody": String::from_utf8_lossy(&capture.resp_body),
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, format!("no capture stored for id {id}")).into_response(),
    }
}
