//! One child backend process: owns the subprocess, its health prober, its
//! optional RPC-endpoint prober, its idle-TTL timer, its concurrency
//! semaphore, and its reasoning session (spec.md §2 item 6, §4.4).

mod health;
mod progress;
mod reasoning;
mod rpc_health;
mod state;
pub mod stop;

pub use health::{HealthOutcome, HealthProber};
pub use progress::{ProgressEvent, ProgressFilter};
pub use reasoning::ReasoningSession;
pub use rpc_health::RpcHealthMonitor;
pub use state::{IllegalTransition, ProcessState, ProcessStateMachine};

use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use http::{Request, Response};
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command;
use crate::config::ModelConfig;
use crate::events::{Event, EventBus};
use crate::logs::LogFanout;

/// Stop signaling waits this long before escalating to SIGKILL (spec.md
/// §4.4.4). Not part of the config schema in spec.md §6.2; chosen as a
/// reasonable fixed default.
pub const DEFAULT_GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn backend: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("invalid command: {0}")]
    InvalidCommand(#[source] command::CommandParseError),
    #[error("health probe did not become ready within the configured budget")]
    HealthTimeout,
    #[error("backend exited during startup")]
    ExitedDuringStartup,
    #[error("request was cancelled")]
    Cancelled,
    #[error("model has no proxy URL")]
    NoProxyUrl,
    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),
    #[error("failed to build response")]
    BuildResponse,
    #[error("request exceeded its configured timeout")]
    RequestTimeout,
}

struct ChildGuard {
    child: Child,
    pid: u32,
}

/// One child backend (spec.md §3.1 Process, §4.4).
pub struct Process {
    pub id: String,
    config: SyncRwLock<ModelConfig>,
    state: ProcessStateMachine,
    state_tx: watch::Sender<ProcessState>,
    child: AsyncMutex<Option<ChildGuard>>,
    /// Held by whichever caller is actually driving a cold start; other
    /// concurrent callers fall back to waiting on `state_tx` instead of
    /// racing the spawn themselves.
    start_lock: AsyncMutex<()>,
    semaphore: Option<Arc<Semaphore>>,
    last_used_epoch_secs: AtomicI64,
    shared_log: Arc<LogFanout>,
    mirror_log: Arc<LogFanout>,
    rpc_monitor: Arc<RpcHealthMonitor>,
    http_client: reqwest::Client,
    events: EventBus,
    health_check_timeout: Duration,
    graceful_stop_timeout: Duration,
    cancel: CancellationToken,
}

impl Process {
    pub fn new(
        id: impl Into<String>,
        config: ModelConfig,
        shared_log: Arc<LogFanout>,
        events: EventBus,
        http_client: reqwest::Client,
        health_check_timeout: Duration,
    ) -> Arc<Self> {
        // The feature is disabled outright unless the model opts in via
        // `rpcHealthCheck` (spec.md §4.4.3: "or the feature is disabled").
        let rpc_endpoints = if config.rpc_health_check {
            config.rpc_endpoints()
        } else {
            Vec::new()
        };
        let concurrency_limit = config.concurrency_limit;
        let (state_tx, _rx) = watch::channel(ProcessState::Stopped);

        let process = Arc::new(Self {
            id: id.into(),
            config: SyncRwLock::new(config),
            state: ProcessStateMachine::new(),
            state_tx,
            child: AsyncMutex::new(None),
            start_lock: AsyncMutex::new(()),
            semaphore: (concurrency_limit > 0).then(|| Arc::new(Semaphore::new(concurrency_limit))),
            last_used_epoch_secs: AtomicI64::new(0),
            shared_log,
            mirror_log: Arc::new(LogFanout::with_capacity(256 * 1024)),
            rpc_monitor: Arc::new(RpcHealthMonitor::new(rpc_endpoints)),
            http_client,
            events,
            health_check_timeout,
            graceful_stop_timeout: DEFAULT_GRACEFUL_STOP_TIMEOUT,
            cancel: CancellationToken::new(),
        });

        process.rpc_monitor.spawn(process.cancel.clone());
        Process::spawn_idle_timer(Arc::clone(&process));
        process
    }

    pub fn state(&self) -> ProcessState {
        self.state.current()
    }

    pub fn config(&self) -> ModelConfig {
        self.config.read().clone()
    }

    /// Swap in a config that did not require a restart (e.g. ttl/alias-only
    /// changes, spec.md §4.8 step 3).
    pub fn update_config(&self, config: ModelConfig) {
        *self.config.write() = config;
    }

    pub fn is_rpc_healthy(&self) -> bool {
        self.rpc_monitor.is_healthy()
    }

    pub fn last_used(&self) -> Option<Instant> {
        // Stored as a wall-clock epoch so the idle timer survives process
        // restarts that would otherwise invalidate an `Instant`.
        let secs = self.last_used_epoch_secs.load(Ordering::Relaxed);
        if secs == 0 {
            return None;
        }
        let now_epoch = now_epoch_secs();
        let elapsed = (now_epoch - secs).max(0) as u64;
        Some(Instant::now() - Duration::from_secs(elapsed))
    }

    fn stamp_last_used(&self) {
        self.last_used_epoch_secs.store(now_epoch_secs(), Ordering::Relaxed);
    }

    fn set_state(&self, to: ProcessState) -> Result<ProcessState, IllegalTransition> {
        let from = self.state.transition(to)?;
        let _ = self.state_tx.send(to);
        self.events.publish(Event::ProcessStateChanged {
            model_id: self.id.clone(),
            from,
            to,
        });
        Ok(from)
    }

    /// Drive the backend to `Ready`, spawning it if necessary. The first
    /// concurrent caller becomes the "starter" and gets back the reasoning
    /// session so it can narrate progress to its own response; followers
    /// wait for the starter to finish and proceed without narration.
    async fn ensure_ready(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<Option<Arc<ReasoningSession>>, ProcessError> {
        if self.state() == ProcessState::Ready {
            return Ok(None);
        }

        match self.start_lock.try_lock() {
            Ok(_permit) => {
                if self.state() == ProcessState::Ready {
                    return Ok(None);
                }
                let reasoning = Arc::new(ReasoningSession::new());
                self.spawn_and_wait_ready(Arc::clone(&reasoning), cancel).await?;
                Ok(Some(reasoning))
            }
            Err(_) => {
                self.wait_for_ready_or_failed(cancel).await?;
                Ok(None)
            }
        }
    }

    async fn wait_for_ready_or_failed(&self, cancel: CancellationToken) -> Result<(), ProcessError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow() {
                ProcessState::Ready => return Ok(()),
                ProcessState::Failed => return Err(ProcessError::ExitedDuringStartup),
                _ => {}
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ProcessError::ExitedDuringStartup);
                    }
                }
                _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
            }
        }
    }

    async fn spawn_and_wait_ready(
        self: &Arc<Self>,
        reasoning: Arc<ReasoningSession>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessError> {
        self.set_state(ProcessState::Starting)
            .map_err(|_| ProcessError::Cancelled)?;

        let config = self.config();
        let argv = command::tokenize(&config.cmd).map_err(ProcessError::InvalidCommand)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        for (key, value) in config.env_vars() {
            cmd.env(key, value);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(false);
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let _ = self.set_state(ProcessState::Failed);
                return Err(ProcessError::SpawnFailed(e));
            }
        };
        let pid = child.id().unwrap_or(0);
        info!(model = %self.id, pid, "spawned backend process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let progress = Arc::new(SyncMutex::new(ProgressFilter::new("load_tensors:")));
        let mut pumps: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = stdout {
            pumps.push(spawn_log_pump(
                stdout,
                Arc::clone(&self.shared_log),
                Arc::clone(&self.mirror_log),
                Arc::clone(&progress),
                Arc::clone(&reasoning),
            ));
        }
        if let Some(stderr) = stderr {
            pumps.push(spawn_log_pump(
                stderr,
                Arc::clone(&self.shared_log),
                Arc::clone(&self.mirror_log),
                Arc::clone(&progress),
                Arc::clone(&reasoning),
            ));
        }

        let proxy_url = config.proxy.clone().unwrap_or_default();
        let prober = HealthProber::new(self.http_client.clone(), &proxy_url, config.health_endpoint());
        let start_cancel = CancellationToken::new();
        let probe_cancel = start_cancel.child_token();

        let exited_early = tokio::select! {
            outcome = prober.probe(self.health_check_timeout, probe_cancel.clone()) => Some(outcome),
            _ = child.wait() => None,
            _ = cancel.cancelled() => {
                start_cancel.cancel();
                None
            }
        };

        *self.child.lock().await = Some(ChildGuard { child, pid });

        match exited_early {
            Some(HealthOutcome::Ready) => {
                self.set_state(ProcessState::Ready).map_err(|_| ProcessError::Cancelled)?;
                reasoning.finish();
                self.events.publish(Event::ModelPreloaded { model_id: self.id.clone() });
                Process::spawn_exit_supervisor(Arc::clone(self), pid);
                Ok(())
            }
            Some(HealthOutcome::TimedOut) => {
                let _ = self.set_state(ProcessState::Failed);
                reasoning.abort();
                self.kill_and_reap().await;
                Err(ProcessError::HealthTimeout)
            }
            Some(HealthOutcome::Cancelled) | None if cancel.is_cancelled() => {
                reasoning.abort();
                Err(ProcessError::Cancelled)
            }
            _ => {
                // Child exited on its own during startup.
                let _ = self.set_state(ProcessState::Failed);
                reasoning.abort();
                Err(ProcessError::ExitedDuringStartup)
            }
        }
    }

    async fn kill_and_reap(&self) {
        let mut guard = self.child.lock().await;
        if let Some(ChildGuard { mut child, pid }) = guard.take() {
            #[cfg(unix)]
            let _ = stop::signal_kill(pid);
            #[cfg(windows)]
            let _ = stop::signal_kill(pid).await;
            let _ = child.wait().await;
        }
    }

    /// Graceful stop (spec.md §4.4.4): signal/cmdStop, wait up to the
    /// configured deadline, escalate to SIGKILL on expiry.
    pub async fn stop_graceful(self: &Arc<Self>) {
        let current = self.state();
        if !matches!(current, ProcessState::Ready | ProcessState::Starting) {
            return;
        }
        if self.set_state(ProcessState::Stopping).is_err() {
            return;
        }

        let config = self.config();
        let pid = {
            let guard = self.child.lock().await;
            guard.as_ref().map(|g| g.pid)
        };
        let Some(pid) = pid else {
            let _ = self.set_state(ProcessState::Stopped);
            return;
        };

        if let Some(cmd_stop) = config.cmd_stop.as_deref() {
            if let Err(e) = stop::run_cmd_stop(cmd_stop, pid).await {
                warn!(model = %self.id, "cmdStop override failed: {e}");
            }
        } else {
            #[cfg(unix)]
            let _ = stop::signal_graceful(pid);
            #[cfg(windows)]
            let _ = stop::signal_graceful(pid).await;
        }

        let reaped = {
            let mut guard = self.child.lock().await;
            if let Some(ChildGuard { child, .. }) = guard.as_mut() {
                tokio::time::timeout(self.graceful_stop_timeout, child.wait()).await.is_ok()
            } else {
                true
            }
        };

        if !reaped {
            debug!(model = %self.id, "graceful stop deadline expired, escalating to SIGKILL");
            self.kill_and_reap().await;
        } else {
            let mut guard = self.child.lock().await;
            *guard = None;
        }

        let _ = self.set_state(ProcessState::Stopped);
    }

    /// Immediate stop: SIGKILL straight away, no grace period.
    pub async fn stop_immediate(self: &Arc<Self>) {
        let current = self.state();
        if !matches!(current, ProcessState::Ready | ProcessState::Starting) {
            return;
        }
        if self.set_state(ProcessState::Stopping).is_err() {
            return;
        }
        self.kill_and_reap().await;
        let _ = self.set_state(ProcessState::Stopped);
    }

    /// Tear down background tasks; called when the process is removed
    /// entirely (config no longer lists the model, or manager shutdown).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Supervise a just-started child so an unexpected exit while `Ready`
    /// actually drives the `ready -> failed` transition (spec.md §4.4.1).
    /// Polls with `try_wait` rather than owning the blocking `wait()`
    /// future so it never holds the child lock across an await point —
    /// `stop_graceful`/`stop_immediate` still reap the same child handle
    /// without contending with this task.
    fn spawn_exit_supervisor(process: Arc<Self>, pid: u32) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SUPERVISOR_POLL_INTERVAL) => {}
                    _ = process.cancel.cancelled() => return,
                }

                let mut guard = process.child.lock().await;
                let exited = match guard.as_mut() {
                    Some(ChildGuard { child, pid: current_pid }) if *current_pid == pid => {
                        matches!(child.try_wait(), Ok(Some(_)))
                    }
                    // The child was replaced or already reaped by a stop;
                    // this supervisor's job is done either way.
                    _ => return,
                };
                if !exited {
                    continue;
                }
                *guard = None;
                drop(guard);

                if process.state() == ProcessState::Ready {
                    warn!(model = %process.id, pid, "backend exited unexpectedly while ready");
                    let _ = process.set_state(ProcessState::Failed);
                }
                return;
            }
        });
    }

    fn spawn_idle_timer(process: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {}
                    _ = process.cancel.cancelled() => return,
                }
                if process.state() != ProcessState::Ready {
                    continue;
                }
                let ttl = process.config().ttl;
                if ttl == 0 {
                    continue;
                }
                if let Some(last_used) = process.last_used() {
                    if last_used.elapsed() >= Duration::from_secs(ttl) {
                        info!(model = %process.id, "idle TTL elapsed, unloading");
                        process.stop_graceful().await;
                    }
                }
            }
        });
    }

    /// Entry point: materialize the backend on demand and proxy one
    /// request through to it (spec.md §4.4.5).
    pub async fn proxy_request(
        self: &Arc<Self>,
        req: Request<Body>,
        cancel: CancellationToken,
    ) -> Result<Response<Body>, ProcessError> {
        let _permit = match &self.semaphore {
            Some(sem) => {
                let sem = Arc::clone(sem);
                tokio::select! {
                    permit = sem.acquire_owned() => Some(permit.map_err(|_| ProcessError::Cancelled)?),
                    _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
                }
            }
            None => None,
        };

        let reasoning = self.ensure_ready(cancel.clone()).await?;

        let config = self.config();
        let proxy_base = config.proxy.clone().ok_or(ProcessError::NoProxyUrl)?;

        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", proxy_base.trim_end_matches('/'), path_and_query);

        let mut headers = parts.headers.clone();
        headers.remove(http::header::ACCEPT_ENCODING);
        headers.insert(
            http::header::ACCEPT_ENCODING,
            http::HeaderValue::from_static("gzip, deflate"),
        );
        headers.remove(http::header::HOST);

        let body_stream = body.into_data_stream();
        let reqwest_body = reqwest::Body::wrap_stream(body_stream);

        let mut builder = self.http_client.request(parts.method.clone(), &url).headers(headers);
        let request_timeout = (config.request_timeout > 0)
            .then(|| Duration::from_secs(config.request_timeout));
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }

        let send_result = tokio::select! {
            result = builder.body(reqwest_body).send() => result,
            _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
        };

        let response = match send_result {
            Ok(r) => r,
            Err(e) if e.is_timeout() && request_timeout.is_some() => {
                let process = Arc::clone(self);
                tokio::spawn(async move { process.stop_graceful().await; });
                return Err(ProcessError::RequestTimeout);
            }
            Err(e) => return Err(ProcessError::Upstream(e)),
        };

        self.stamp_last_used();
        if let Some(session) = &reasoning {
            session.finish();
        }

        let status = response.status();
        let resp_headers = response.headers().clone();
        let upstream_stream = response.bytes_stream();

        let deadline = request_timeout.map(|t| Instant::now() + t);
        let guarded = DeadlineStream {
            inner: Box::pin(upstream_stream),
            deadline,
            process: Arc::clone(self),
            fired: false,
        };

        let body = if let Some(session) = reasoning {
            // `ReasoningSession::attach` wants a plain `Bytes` stream; the
            // first upstream read error simply ends the combined stream.
            let bytes_only = guarded
                .take_while(|item| futures::future::ready(item.is_ok()))
                .map(|item| item.expect("take_while guarantees Ok"));
            let combined = session.attach(bytes_only);
            Body::from_stream(combined.map(Ok::<_, std::io::Error>))
        } else {
            Body::from_stream(guarded)
        };

        let mut response_builder = Response::builder().status(status);
        for (name, value) in resp_headers.iter() {
            response_builder = response_builder.header(name, value);
        }
        response_builder.body(body).map_err(|_| ProcessError::BuildResponse)
    }
}

fn now_epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn spawn_log_pump<R>(
    mut reader: R,
    shared_log: Arc<LogFanout>,
    mirror_log: Arc<LogFanout>,
    progress: Arc<SyncMutex<ProgressFilter>>,
    reasoning: Arc<ReasoningSession>,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    shared_log.write(chunk);
                    mirror_log.write(chunk);
                    let events = progress.lock().push(chunk);
                    for event in events {
                        match event {
                            ProgressEvent::Line(text) => reasoning.append_line(&format!("{text}\n")),
                            ProgressEvent::Dot => reasoning.append_inline("."),
                        }
                    }
                }
            }
        }
    })
}

/// A response body stream that enforces `requestTimeout` by ending the
/// stream and scheduling a graceful stop once the deadline passes
/// (spec.md §4.4.5 step 5).
struct DeadlineStream<S> {
    inner: Pin<Box<S>>,
    deadline: Option<Instant>,
    process: Arc<Process>,
    fired: bool,
}

impl<S> Stream for DeadlineStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(deadline) = self.deadline {
            if !self.fired && Instant::now() >= deadline {
                self.fired = true;
                let process = Arc::clone(&self.process);
                tokio::spawn(async move { process.stop_graceful().await; });
                return Poll::Ready(None);
            }
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Some(Err(std::io::Error::new(std::io::ErrorKind::Other, e))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn test_config() -> ModelConfig {
        ModelConfig {
            cmd: "sleep 100".into(),
            cmd_stop: None,
            proxy: Some("http://127.0.0.1:1".into()),
            aliases: vec![],
            env: vec![],
            check_endpoint: "none".into(),
            ttl: 0,
            unlisted: false,
            use_model_name: None,
            concurrency_limit: 0,
            request_timeout: 0,
            force_restart: None,
            rpc_health_check: false,
        }
    }

    fn test_process() -> Arc<Process> {
        Process::new(
            "m1",
            test_config(),
            Arc::new(LogFanout::with_capacity(1024)),
            EventBus::new(),
            reqwest::Client::new(),
            Duration::from_secs(15),
        )
    }

    #[tokio::test]
    async fn starts_stopped() {
        let p = test_process();
        assert_eq!(p.state(), ProcessState::Stopped);
        p.shutdown();
    }

    #[tokio::test]
    async fn rpc_health_defaults_true_when_no_rpc_flag() {
        let p = test_process();
        assert!(p.is_rpc_healthy());
        p.shutdown();
    }

    #[tokio::test]
    async fn config_update_is_visible_without_restart() {
        let p = test_process();
        let mut cfg = test_config();
        cfg.ttl = 120;
        p.update_config(cfg);
        assert_eq!(p.config().ttl, 120);
        p.shutdown();
    }
}
