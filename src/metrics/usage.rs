//! Token-usage extraction from upstream JSON bodies (spec.md §4.10.1).

use serde_json::Value;

/// Parsed usage figures for one completed request. Defaults mirror
/// spec.md §4.10.1: absent token counts are 0, absent rates are -1.0,
/// absent cached count is -1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageExtraction {
    pub cached_tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub prompt_per_second: f64,
    pub tokens_per_second: f64,
    pub duration_ms: i64,
}

impl Default for UsageExtraction {
    fn default() -> Self {
        Self {
            cached_tokens: -1,
            input_tokens: 0,
            output_tokens: 0,
            prompt_per_second: -1.0,
            tokens_per_second: -1.0,
            duration_ms: 0,
        }
    }
}

fn as_i64(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(Value::as_i64)
}

fn as_f64(value: &Value, key: &str) -> Option<f64> {
    value.get(key).and_then(Value::as_f64)
}

/// Extract usage from one parsed JSON body. Checks the OpenAI-style `usage`
/// object first, then lets a llama.cpp-style `timings` object override
/// anything it carries (spec.md §4.10.1) — a body with both present favors
/// the more precise `timings` figures.
pub fn extract(value: &Value) -> UsageExtraction {
    let mut out = UsageExtraction::default();

    if let Some(usage) = value.get("usage") {
        if let Some(tokens) = as_i64(usage, "prompt_tokens").or_else(|| as_i64(usage, "input_tokens")) {
            out.input_tokens = tokens;
        }
        if let Some(tokens) = as_i64(usage, "completion_tokens").or_else(|| as_i64(usage, "output_tokens")) {
            out.output_tokens = tokens;
        }
        if let Some(cached) = as_i64(usage, "cache_read_input_tokens") {
            out.cached_tokens = cached;
        }
    }

    if let Some(timings) = value.get("timings") {
        if let Some(prompt_n) = as_i64(timings, "prompt_n") {
            out.input_tokens = prompt_n;
        }
        if let Some(predicted_n) = as_i64(timings, "predicted_n") {
            out.output_tokens = predicted_n;
        }
        if let Some(cache_n) = as_i64(timings, "cache_n") {
            out.cached_tokens = cache_n;
        }
        if let Some(pps) = as_f64(timings, "prompt_per_second") {
            out.prompt_per_second = pps;
        }
        if let Some(tps) = as_f64(timings, "predicted_per_second") {
            out.tokens_per_second = tps;
        }
        if timings.get("prompt_ms").is_some() || timings.get("predicted_ms").is_some() {
            let prompt_ms = as_f64(timings, "prompt_ms").unwrap_or(0.0);
            let predicted_ms = as_f64(timings, "predicted_ms").unwrap_or(0.0);
            out.duration_ms = (prompt_ms + predicted_ms).round() as i64;
        }
    }

    out
}

fn strip_trailing_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Scan an SSE body backwards, line by line, for the last `data:` line
/// carrying a `usage` or `timings` object (spec.md §4.10 step 4). Walks
/// `rsplit` lazily from the end rather than collecting every line up front,
/// so a long stream's cost is proportional to how close the usage line sits
/// to the tail, not to the stream's total length.
pub fn extract_from_sse_reverse(body: &[u8]) -> Option<UsageExtraction> {
    for raw_line in body.rsplit(|&b| b == b'\n') {
        let line = strip_trailing_cr(raw_line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let Ok(payload) = std::str::from_utf8(rest) else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(payload) {
            if value.get("usage").is_some() || value.get("timings").is_some() {
                return Some(extract(&value));
            }
        }
    }
    None
}

/// Parse a whole (non-streaming) JSON body (spec.md §4.10 step 5). `/infill`
/// responses whose top level is an array use the array's last element.
pub fn extract_from_whole_body(body: &[u8], is_infill_route: bool) -> Option<UsageExtraction> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let value = match (&value, is_infill_route) {
        (Value::Array(items), true) => items.last().cloned().unwrap_or(Value::Null),
        _ => value,
    };
    Some(extract(&value))
}
