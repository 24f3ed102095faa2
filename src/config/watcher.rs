//! Config hot-reload file watcher (spec.md §4.8).
//!
//! Polls the config file's mtime+size at a configurable interval and only
//! fires once the file has been stable (no further changes observed) for at
//! least the debounce window — protects against reading a config file while
//! an editor is still mid-write.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use notify::{Config as NotifyConfig, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    mtime: Option<SystemTime>,
}

fn stamp(path: &Path) -> Option<FileStamp> {
    let meta = fs::metadata(path).ok()?;
    Some(FileStamp {
        size: meta.len(),
        mtime: meta.modified().ok(),
    })
}

pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, debounce: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            debounce,
        }
    }

    /// Watch the config file, invoking `on_change` with the file's new
    /// contents each time a debounced change settles. Runs until the
    /// underlying watch channel closes (process exit) or is aborted by the
    /// caller.
    pub async fn run<F, Fut>(self, mut on_change: F)
    where
        F: FnMut(String) -> Fut + Send,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let notify_config = NotifyConfig::default().with_poll_interval(self.poll_interval);
        let mut watcher = match PollWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    let _ = tx.send(());
                }
            },
            notify_config,
        ) {
            Ok(w) => w,
            Err(e) => {
                error!("failed to start config watcher: {e}");
                return;
            }
        };

        if let Err(e) = watcher.watch(&self.path, RecursiveMode::NonRecursive) {
            error!("failed to watch {}: {e}", self.path.display());
            return;
        }

        let mut last_stamp = stamp(&self.path);
        while rx.recv().await.is_some() {
            // Drain any extra notifications coalesced while we were asleep.
            while rx.try_recv().is_ok() {}

            loop {
                tokio::time::sleep(self.debounce).await;
                while rx.try_recv().is_ok() {}

                let observed = stamp(&self.path);
                if observed == last_stamp {
                    break; // watcher fired spuriously; nothing actually changed
                }

                // Settle check: re-stamp once more to confirm the write finished.
                tokio::time::sleep(Duration::from_millis(50)).await;
                let settled = stamp(&self.path);
                if settled != observed {
                    continue; // still being written, keep waiting
                }

                last_stamp = settled;
                match fs::read_to_string(&self.path) {
                    Ok(contents) => on_change(contents).await,
                    Err(e) => warn!("failed to read {} after change: {e}", self.path.display()),
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn stamp_changes_when_file_contents_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "a").unwrap();
        file.flush().unwrap();
        let first = stamp(file.path());

        std::thread::sleep(Duration::from_millis(10));
        write!(file, "bb").unwrap();
        file.flush().unwrap();
        let second = stamp(file.path());

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn debounced_change_invokes_callback_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "initial: true\n").unwrap();
        file.flush().unwrap();

        let watcher = ConfigWatcher::new(file.path(), Duration::from_millis(20), Duration::from_millis(40));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let handle = tokio::spawn(async move {
            watcher
                .run(|_contents| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        write!(file, "changed: true\n").unwrap();
        file.flush().unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
