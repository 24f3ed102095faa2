//! OpenAI-compatible proxy endpoints (spec.md §6.1): every route in
//! [`super::PROXIED_ROUTES`] shares this one handler, since routing only
//! ever depends on the body's `model` field, never the path.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use http::{Request, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::group::GroupError;
use crate::manager::{Manager, ManagerError};
use crate::peer::PeerError;
use crate::process::ProcessError;

/// Cancels the wrapped token when dropped. Held for the lifetime of
/// [`proxy_completions`]'s call to the spawned proxy task below; if axum
/// drops that handler future early (client disconnect), this guard's drop
/// glue fires `cancel()` on a token the still-running spawned task is
/// actively polling, so the cancellation is observed for real rather than
/// the whole future tree simply vanishing unpolled.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({
        "error": {
            "message": message.into(),
            "type": "proxy_error",
        }
    });
    (status, axum::Json(body)).into_response()
}

impl ManagerError {
    /// Map an internal routing/proxy failure onto the HTTP status a client
    /// should see (spec.md §4.10 edge cases: unknown model is a client
    /// error, everything downstream of that is a gateway failure).
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ManagerError::UnknownModel(model) => {
                (StatusCode::BAD_REQUEST, format!("unknown model `{model}`"))
            }
            ManagerError::Group(GroupError::UnknownModel(model)) => {
                (StatusCode::BAD_REQUEST, format!("unknown model `{model}`"))
            }
            ManagerError::Group(GroupError::Process(ProcessError::RequestTimeout)) => {
                (StatusCode::GATEWAY_TIMEOUT, "request exceeded its configured timeout".into())
            }
            ManagerError::Group(GroupError::Process(ProcessError::Cancelled)) => {
                (StatusCode::BAD_REQUEST, "request was cancelled".into())
            }
            ManagerError::Group(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
            ManagerError::Peer(PeerError::UnknownModel(model)) => {
                (StatusCode::BAD_REQUEST, format!("unknown model `{model}`"))
            }
            ManagerError::Peer(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
        }
    }
}

/// Proxy one OpenAI-compatible request: buffer the body far enough to read
/// `model`, rebuild the request body unchanged, and hand off to the
/// manager. The actual proxying runs on its own spawned task so that a
/// client disconnect — which drops this handler's future — cancels the
/// token the task is polling instead of just abandoning it (spec.md
/// §4.4.5 item 1, §5).
pub async fn proxy_completions(State(manager): State<Arc<Manager>>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
    };

    let model_name = match serde_json::from_slice::<serde_json::Value>(&body_bytes) {
        Ok(value) => value.get("model").and_then(|m| m.as_str()).map(str::to_string),
        Err(_) => None,
    };
    let Some(model_name) = model_name else {
        return error_response(StatusCode::BAD_REQUEST, "request body must contain a `model` field");
    };

    let rebuilt = Request::from_parts(parts, Body::from(body_bytes));
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task_manager = Arc::clone(&manager);
    let task_model_name = model_name.clone();

    let handle = tokio::spawn(async move {
        task_manager.proxy_request(&task_model_name, rebuilt, task_cancel).await
    });

    // Dropped only when this function returns or its future is cancelled
    // out from under it; either way `cancel` ends up flipped.
    let _cancel_guard = CancelOnDrop(cancel);

    match handle.await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            let (status, message) = err.status_and_message();
            error_response(status, message)
        }
        Err(_join_err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "proxy task panicked"),
    }
}

/// `GET /v1/models` (spec.md §6.1): every non-`unlisted` model, OpenAI's
/// `{"object":"list","data":[...]}` envelope.
pub async fn list_models(State(manager): State<Arc<Manager>>) -> Response {
    let data: Vec<_> = manager
        .model_listing()
        .into_iter()
        .map(|model| {
            json!({
                "id": model.id,
                "object": "model",
                "owned_by": model.display_name,
            })
        })
        .collect();
    axum::Json(json!({ "object": "list", "data": data })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_maps_to_bad_request() {
        let err = ManagerError::UnknownModel("ghost".to_string());
        let (status, message) = err.status_and_message();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(message.contains("ghost"));
    }

    #[test]
    fn request_timeout_maps_to_gateway_timeout() {
        let err = ManagerError::Group(GroupError::Process(ProcessError::RequestTimeout));
        let (status, _) = err.status_and_message();
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }
}
