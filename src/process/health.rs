//! HTTP health probing for a backend process (spec.md §4.4.2).

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PER_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECTION_REFUSED_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// A probe returned 200.
    Ready,
    /// The overall budget elapsed, or connection-refused persisted past its
    /// own grace window, without a single 200.
    TimedOut,
    /// The caller's cancellation token fired (process exit, shutdown).
    Cancelled,
}

pub struct HealthProber {
    client: reqwest::Client,
    /// `None` means `checkEndpoint: none` — probing is disabled.
    url: Option<String>,
}

impl HealthProber {
    /// `base_url` is the process's proxy URL; `endpoint` is
    /// `ModelConfig::health_endpoint()`'s result (`None` disables probing).
    pub fn new(client: reqwest::Client, base_url: &str, endpoint: Option<&str>) -> Self {
        let url = endpoint.map(|path| format!("{}{}", base_url.trim_end_matches('/'), path));
        Self { client, url }
    }

    /// Poll until ready, timed out, or cancelled. Disabled probers report
    /// ready immediately (spec.md §4.4.2: `"none"` disables).
    pub async fn probe(&self, overall_timeout: Duration, cancel: CancellationToken) -> HealthOutcome {
        let Some(url) = self.url.as_deref() else {
            return HealthOutcome::Ready;
        };

        let start = Instant::now();
        let mut refused_since: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return HealthOutcome::Cancelled;
            }
            if start.elapsed() >= overall_timeout {
                return HealthOutcome::TimedOut;
            }

            match self
                .client
                .get(url)
                .timeout(PER_REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) if resp.status().as_u16() == 200 => return HealthOutcome::Ready,
                Ok(_) => refused_since = None,
                Err(e) if e.is_connect() => {
                    let since = *refused_since.get_or_insert(Instant::now());
                    if since.elapsed() >= CONNECTION_REFUSED_GRACE {
                        debug!("health probe: connection refused past grace window, giving up");
                        return HealthOutcome::TimedOut;
                    }
                }
                Err(_) => refused_since = None,
            }

            tokio::select! {
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                _ = cancel.cancelled() => return HealthOutcome::Cancelled,
            }
        }
    }
}
