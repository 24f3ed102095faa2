//! Reasoning session: surfaces cold-start progress as OpenAI-style SSE
//! `reasoning_content` deltas so an unmodified client sees activity while
//! the real backend boots (spec.md §4.6).
//!
//! Two emitter modes share one ordering contract: buffered segments, then
//! an inline-break separator if one is pending, then whatever bytes follow
//! (spec.md §9: "model as a pair of variants behind one interface").

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

fn encode_segment(text: &str) -> Bytes {
    let json_text = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string());
    Bytes::from(format!(
        "data: {{\"choices\":[{{\"delta\":{{\"reasoning_content\":{json_text}}}}}]}}\n\n"
    ))
}

enum Mode {
    Buffered(Vec<Bytes>),
    Live(mpsc::UnboundedSender<Bytes>),
}

struct Inner {
    mode: Mode,
    /// Set by `append_inline`; cleared (with a separator emitted first) by
    /// the next `append_line`.
    pending_inline: bool,
    /// Set by `finish`/`abort`. Separate from `mode` so a `finish`-then-
    /// `attach` pair still sees the segments `finish` just queued — `mode`
    /// itself never becomes a dead end.
    closed: bool,
}

pub struct ReasoningSession {
    inner: Mutex<Inner>,
}

impl ReasoningSession {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: Mode::Buffered(Vec::new()),
                pending_inline: false,
                closed: false,
            }),
        }
    }

    fn emit(inner: &mut Inner, chunk: Bytes) {
        if inner.closed {
            return;
        }
        match &mut inner.mode {
            Mode::Buffered(segments) => segments.push(chunk),
            Mode::Live(tx) => {
                let _ = tx.send(chunk);
            }
        }
    }

    /// Queue a text segment that must end with a newline. If an inline
    /// segment is pending, a separator is emitted first.
    pub fn append_line(&self, text: &str) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if inner.pending_inline {
            let sep = encode_segment("\n");
            Self::emit(&mut inner, sep);
            inner.pending_inline = false;
        }
        let chunk = encode_segment(text);
        Self::emit(&mut inner, chunk);
    }

    /// Queue a text segment without a trailing newline. Consecutive inline
    /// segments are joined without a separator.
    pub fn append_inline(&self, text: &str) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let chunk = encode_segment(text);
        Self::emit(&mut inner, chunk);
        inner.pending_inline = true;
    }

    /// Bind the session to the upstream body: flush queued segments, then
    /// the upstream bytes. Intended for requests that were buffered for
    /// their whole cold-start and only now have a real response to attach.
    ///
    /// Works whether or not `finish`/`abort` was already called — only the
    /// live/buffered distinction matters here, not the closed flag.
    pub fn attach<S>(&self, body: S) -> impl Stream<Item = Bytes> + Send + 'static
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        let queued = {
            let mut inner = self.inner.lock();
            match &mut inner.mode {
                Mode::Buffered(segments) => std::mem::take(segments),
                Mode::Live(_) => Vec::new(),
            }
        };
        stream::iter(queued).chain(body)
    }

    /// Stream segments directly to a writer as they arrive, switching the
    /// session from buffered to live. Already-queued segments are flushed
    /// first, in order, before the live pump starts forwarding new ones.
    pub fn attach_writer<W>(&self, mut writer: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let queued = {
            let mut inner = self.inner.lock();
            match std::mem::replace(&mut inner.mode, Mode::Live(tx)) {
                Mode::Buffered(segments) => segments,
                Mode::Live(_) => Vec::new(),
            }
        };

        tokio::spawn(async move {
            for chunk in queued {
                if writer.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            let _ = writer.flush().await;
            while let Some(chunk) = rx.recv().await {
                if writer.write_all(&chunk).await.is_err() {
                    return;
                }
                let _ = writer.flush().await;
            }
        });
    }

    /// Close the reasoning phase with a trailing blank separator. Idempotent
    /// once finished or aborted.
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let closing = encode_segment("\n");
        Self::emit(&mut inner, closing);
        inner.closed = true;
    }

    /// Discard any pending state; nothing further is ever emitted.
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        if let Mode::Buffered(segments) = &mut inner.mode {
            segments.clear();
        }
        inner.closed = true;
    }
}

impl Default for ReasoningSession {
    fn default() -> Self {
        Self::new()
    }
}
