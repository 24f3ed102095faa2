//! Scenario 2 (spec.md §8, §4.6): a cold-start request to a model whose
//! backend prints loader progress on stdout gets that progress interleaved
//! as `reasoning_content` SSE frames ahead of the real response body.

mod support;

use support::{fake_backend_path, manager_from_yaml, send_chat_raw};

fn config_yaml(bin: &str) -> String {
    format!(
        r#"
startPort: 6200
models:
  a:
    cmd: "{bin} --port ${{PORT}} --tag a --progress --ready-delay-ms 1500"
"#
    )
}

#[tokio::test]
async fn loader_progress_streams_as_reasoning_before_the_real_response() {
    let bin = fake_backend_path();
    let manager = manager_from_yaml(&config_yaml(bin));

    let raw = send_chat_raw(&manager, "a").await.expect("model a should respond once ready");
    let text = String::from_utf8_lossy(&raw);

    let reasoning_frames: Vec<&str> = text.lines().filter(|l| l.contains("reasoning_content")).collect();
    assert!(!reasoning_frames.is_empty(), "cold-start progress must surface as reasoning frames: {text}");

    let line_frames = reasoning_frames.iter().filter(|l| l.contains("load_tensors: loading model tensors")).count();
    assert_eq!(line_frames, 1, "the loader's progress line must appear exactly once: {text}");

    let dot_frames = reasoning_frames
        .iter()
        .filter(|l| l.contains("\"reasoning_content\":\".\"") || l.contains("\"reasoning_content\": \".\""))
        .count();
    assert_eq!(dot_frames, 5, "all five spinner dots must surface individually: {text}");

    assert!(text.contains("\"backend\":\"a\""), "the real response must still follow: {text}");
    let reasoning_at = text.find("load_tensors:").expect("progress line must appear somewhere");
    let body_at = text.find("\"backend\":\"a\"").expect("final response body must appear somewhere");
    assert!(reasoning_at < body_at, "reasoning frames must precede the upstream body, got: {text}");
}
