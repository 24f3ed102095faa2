//! Minimal llama.cpp-server stand-in used by the integration suite under
//! `tests/`. Not part of the public crate surface; built only as a sibling
//! `[[bin]]` so tests can spawn it via `env!("CARGO_BIN_EXE_fake-backend")`.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use http::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Parser)]
struct Args {
    #[arg(long)]
    port: u16,

    /// Tag echoed back in every completion's `backend` field, so tests can
    /// tell which fixture instance actually answered.
    #[arg(long, default_value = "backend")]
    tag: String,

    /// Milliseconds of simulated load time before `/health` reports ready.
    #[arg(long, default_value_t = 0)]
    ready_delay_ms: u64,

    /// Print a `load_tensors:` progress line plus a short dot run on
    /// startup, the way a real llama.cpp server's loader does.
    #[arg(long, default_value_t = false)]
    progress: bool,

    /// Never respond to `/v1/chat/completions`; used to exercise the
    /// request-timeout path.
    #[arg(long, default_value_t = false)]
    hang: bool,
}

struct AppState {
    ready: Arc<AtomicBool>,
    hang: bool,
    tag: String,
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::OK.into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn completions(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    if state.hang {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }

    let model = body.get("model").and_then(Value::as_str).unwrap_or("unknown");
    Json(json!({
        "id": "fake-completion",
        "object": "chat.completion",
        "model": model,
        "backend": state.tag,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": "ok" },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": 12,
            "completion_tokens": 4,
            "total_tokens": 16,
        },
    }))
    .into_response()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.progress {
        // The exact bytes spec.md §8 scenario 2 uses as its progress-filter
        // fixture.
        print!("load_tensors: loading model tensors\n.....\n");
        let _ = std::io::stdout().flush();
    }

    let ready = Arc::new(AtomicBool::new(args.ready_delay_ms == 0));
    if args.ready_delay_ms > 0 {
        let ready = Arc::clone(&ready);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(args.ready_delay_ms)).await;
            ready.store(true, Ordering::SeqCst);
        });
    }

    let state = Arc::new(AppState { ready, hang: args.hang, tag: args.tag });
    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(completions))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = TcpListener::bind(addr).await.expect("fake backend failed to bind its port");
    axum::serve(listener, app).await.expect("fake backend server error");
}
