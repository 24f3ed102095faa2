//! Progress filter: splits a child process's stdout/stderr byte stream into
//! lines, surfacing the ones that look like cold-start progress (spec.md
//! §4.5).

/// One unit of progress extracted from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A full, non-empty, non-dot line containing the configured marker.
    Line(String),
    /// A single `.` from a dot-only line (spinner tick).
    Dot,
}

/// Ignoring any `\r`, is `bytes` composed entirely of `.` and non-empty?
fn is_dot_line(bytes: &[u8]) -> bool {
    let mut saw_dot = false;
    for &b in bytes {
        match b {
            b'.' => saw_dot = true,
            b'\r' => continue,
            _ => return false,
        }
    }
    saw_dot
}

fn strip_trailing_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// A byte sink that buffers partial lines across `push` calls.
pub struct ProgressFilter {
    buffer: Vec<u8>,
    marker: String,
}

impl ProgressFilter {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            buffer: Vec::new(),
            marker: marker.into(),
        }
    }

    /// Feed in the next chunk of raw bytes, returning any progress events
    /// that can now be determined. Bytes with no terminating newline are
    /// retained for the next call, unless they form a dot-only run, which
    /// is flushed immediately for low-latency spinner feedback.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ProgressEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_with_newline: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = strip_trailing_cr(&line_with_newline[..line_with_newline.len() - 1]);
            self.emit_line(line, &mut events);
        }

        if !self.buffer.is_empty() && is_dot_line(&self.buffer) {
            self.emit_dots(&self.buffer.clone(), &mut events);
            self.buffer.clear();
        }

        events
    }

    fn emit_line(&self, line: &[u8], events: &mut Vec<ProgressEvent>) {
        if line.is_empty() {
            return;
        }
        if is_dot_line(line) {
            self.emit_dots(line, events);
            return;
        }
        if let Ok(text) = std::str::from_utf8(line) {
            if text.contains(&self.marker) {
                events.push(ProgressEvent::Line(text.to_string()));
            }
        }
    }

    fn emit_dots(&self, bytes: &[u8], events: &mut Vec<ProgressEvent>) {
        for &b in bytes {
            if b == b'.' {
                events.push(ProgressEvent::Dot);
            }
        }
    }
}
