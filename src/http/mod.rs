//! The HTTP surface: an OpenAI-compatible proxy front door plus the admin
//! endpoints for logs, metrics, captures, and reload (spec.md §6.1).
//!
//! The router is intentionally thin — every handler's job is to pull
//! whatever the URL/body/query needs out of the request and hand off to
//! [`crate::manager::Manager`] as fast as possible. No handler owns state
//! beyond the shared `Arc<Manager>`.

mod admin;
mod chat;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::manager::Manager;

/// Endpoints that all resolve a `model` field from the request body and
/// proxy to it unmodified (spec.md §6.1: "the router resolves `model` the
/// same way for every OpenAI-compatible route").
const PROXIED_ROUTES: &[&str] = &[
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/audio/transcriptions",
    "/v1/audio/speech",
    "/v1/rerank",
    "/infill",
];

/// Build the full `axum::Router` wired to one [`Manager`].
pub fn router(manager: Arc<Manager>) -> Router {
    let mut router = Router::new();
    for path in PROXIED_ROUTES {
        router = router.route(path, post(chat::proxy_completions));
    }
    router
        .route("/v1/models", get(chat::list_models))
        .route("/logs", get(admin::logs_text))
        .route("/logs/streamSSE", get(admin::logs_stream_sse))
        .route("/metrics/history", get(admin::metrics_history))
        .route("/metrics/capture/:id", get(admin::get_capture))
        .with_state(manager)
}
