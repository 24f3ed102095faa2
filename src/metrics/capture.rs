//! Redacted request/response capture with a byte-budgeted FIFO ring
//! (spec.md §3.1 ReqRespCapture, §3.2, §4.10 step 7).

use std::collections::{HashMap, VecDeque};

use http::HeaderMap;

/// Header names whose values are replaced with `[REDACTED]` before a
/// capture is stored (case-insensitive match, spec.md §4.10).
const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
];

/// Snapshot a header map, replacing sensitive values with `[REDACTED]`.
pub fn redact_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = name.as_str().to_string();
            let sensitive = REDACTED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(&name));
            let value = if sensitive {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("").to_string()
            };
            (name, value)
        })
        .collect()
}

/// A stored, header-redacted copy of one request/response pair.
#[derive(Debug, Clone)]
pub struct ReqRespCapture {
    pub id: u64,
    pub req_path: String,
    pub req_headers: HashMap<String, String>,
    pub req_body: Vec<u8>,
    pub resp_headers: HashMap<String, String>,
    pub resp_body: Vec<u8>,
}

impl ReqRespCapture {
    fn approx_size(&self) -> usize {
        self.req_body.len()
            + self.resp_body.len()
            + header_bytes(&self.req_headers)
            + header_bytes(&self.resp_headers)
            + self.req_path.len()
    }
}

fn header_bytes(headers: &HashMap<String, String>) -> usize {
    headers.iter().map(|(k, v)| k.len() + v.len()).sum()
}

/// FIFO-evicting ring bounded by total byte size rather than entry count
/// (spec.md §3.2: "captures are dropped oldest-first once the configured
/// byte budget is exceeded").
pub struct CaptureRing {
    max_bytes: usize,
    total_bytes: usize,
    entries: VecDeque<ReqRespCapture>,
}

impl CaptureRing {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            total_bytes: 0,
            entries: VecDeque::new(),
        }
    }

    /// Insert a capture, evicting the oldest entries until the ring is back
    /// under budget. A single capture larger than the whole budget is
    /// dropped without being stored and `false` is returned.
    pub fn insert(&mut self, capture: ReqRespCapture) -> bool {
        let size = capture.approx_size();
        if size > self.max_bytes {
            return false;
        }
        self.entries.push_back(capture);
        self.total_bytes += size;
        while self.total_bytes > self.max_bytes {
            match self.entries.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.approx_size(),
                None => break,
            }
        }
        true
    }

    pub fn get(&self, id: u64) -> Option<&ReqRespCapture> {
        self.entries.iter().find(|c| c.id == id)
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
