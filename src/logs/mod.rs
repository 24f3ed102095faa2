//! Shared upstream log fan-out (spec.md §4.3).
//!
//! `Write` is multi-writer (every process tees its stdout/stderr here);
//! history is a single fixed-capacity ring; each subscriber gets its own
//! broadcast receiver and silently falls behind rather than blocking a
//! writer (tokio::sync::broadcast's lagged-receiver semantics already give
//! us this for free).

mod ring;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use ring::ByteRing;

const DEFAULT_HISTORY_CAPACITY: usize = 1024 * 1024;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// A log chunk as delivered to subscribers; reference-counted so fan-out to
/// many subscribers is a pointer clone, not a copy.
pub type LogChunk = Arc<[u8]>;

pub struct LogFanout {
    history: Mutex<ByteRing>,
    tx: broadcast::Sender<LogChunk>,
}

impl LogFanout {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(history_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        Self {
            history: Mutex::new(ByteRing::new(history_capacity)),
            tx,
        }
    }

    /// Accept an arbitrary byte chunk. Defensively copies `bytes` since
    /// callers (process stdout pumps) reuse their buffers.
    pub fn write(&self, bytes: &[u8]) {
        let chunk: LogChunk = Arc::from(bytes);
        self.history.lock().push(&chunk);
        // A send error just means there are currently no subscribers.
        let _ = self.tx.send(chunk);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogChunk> {
        self.tx.subscribe()
    }

    /// Symmetric counterpart to `subscribe`; tokio's broadcast channel
    /// already drops a subscription when its receiver is dropped, so this
    /// simply makes that explicit at call sites.
    pub fn unsubscribe(&self, receiver: broadcast::Receiver<LogChunk>) {
        drop(receiver);
    }

    pub fn history(&self) -> Vec<u8> {
        self.history.lock().snapshot()
    }
}

impl Default for LogFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_accumulates_writes() {
        let log = LogFanout::with_capacity(1024);
        log.write(b"hello ");
        log.write(b"world");
        assert_eq!(log.history(), b"hello world");
    }

    #[tokio::test]
    async fn subscriber_receives_subsequent_writes_only() {
        let log = LogFanout::with_capacity(1024);
        log.write(b"before");
        let mut rx = log.subscribe();
        log.write(b"after");
        let chunk = rx.recv().await.unwrap();
        assert_eq!(&*chunk, b"after");
    }

    #[tokio::test]
    async fn write_with_no_subscribers_does_not_panic() {
        let log = LogFanout::with_capacity(1024);
        log.write(b"anything");
    }

    #[test]
    fn history_is_capped() {
        let log = LogFanout::with_capacity(4);
        log.write(b"abcdefgh");
        assert_eq!(log.history(), b"efgh");
    }
}
