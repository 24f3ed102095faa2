//! Shared harness for the end-to-end scenario suite (spec.md §8): builds a
//! real [`Manager`] wired to the `fake-backend` fixture binary and drives
//! it the same way `modelmuxd`'s HTTP layer does, minus the HTTP layer
//! itself — straight calls into [`Manager::proxy_request`].

use std::sync::Arc;
use std::time::Duration;

use http::Request;
use modelmux::config::Config;
use modelmux::events::Event;
use modelmux::logs::LogFanout;
use modelmux::manager::{Manager, ManagerError};
use modelmux::process::ProcessState;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Absolute path to the fixture binary built alongside `modelmuxd`.
pub fn fake_backend_path() -> &'static str {
    env!("CARGO_BIN_EXE_fake-backend")
}

/// Build a [`Manager`] from a YAML document, the same way `modelmuxd`
/// does at startup (see `src/main.rs`), minus the config file watcher.
pub fn manager_from_yaml(yaml: &str) -> Arc<Manager> {
    let config = Config::from_yaml(yaml).expect("test fixture config must be valid");
    Manager::new(config, Arc::new(LogFanout::with_capacity(1024 * 1024)), reqwest::Client::new())
}

fn chat_request(model: &str) -> Request<axum::body::Body> {
    let body = serde_json::json!({
        "model": model,
        "messages": [{ "role": "user", "content": "hello" }],
    });
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

/// Proxy a chat-completion call for `model` and return the raw response
/// bytes (status is not inspected here; scenarios that expect failure use
/// [`send_chat`] instead, which surfaces the manager's `Result`).
pub async fn send_chat_raw(manager: &Arc<Manager>, model: &str) -> Result<Vec<u8>, ManagerError> {
    let response = manager.proxy_request(model, chat_request(model), CancellationToken::new()).await?;
    let (_, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.expect("response body must be readable");
    Ok(bytes.to_vec())
}

/// Proxy a chat-completion call for `model` and parse the response body as
/// JSON (the fixture's completions endpoint always returns JSON, even when
/// a cold-start reasoning preamble precedes it — callers that care about
/// the preamble use [`send_chat_raw`]).
pub async fn send_chat(manager: &Arc<Manager>, model: &str) -> Result<serde_json::Value, ManagerError> {
    let raw = send_chat_raw(manager, model).await?;
    let text = String::from_utf8_lossy(&raw);
    // Skip any `data: ...\n\n` reasoning frames the cold-start preamble may
    // have prepended; the real JSON response is the last non-empty line.
    let json_line = text
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('{') && !line.contains("reasoning_content"))
        .unwrap_or(&text);
    Ok(serde_json::from_str(json_line).expect("final response segment must be JSON"))
}

/// Drain whatever the event bus delivers within `window`, then stop.
pub async fn drain_events(rx: &mut broadcast::Receiver<Event>, window: Duration) -> Vec<Event> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return events;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return events,
        }
    }
}

/// Every `(from, to)` state transition recorded for `model_id`, in order.
pub fn state_changes(events: &[Event], model_id: &str) -> Vec<(ProcessState, ProcessState)> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::ProcessStateChanged { model_id: id, from, to } if id == model_id => Some((*from, *to)),
            _ => None,
        })
        .collect()
}
