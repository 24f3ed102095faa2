//! Process group arbitration: mutual exclusion between models declared in
//! one group (spec.md §3.1 ProcessGroup, §4.7).

use std::sync::Arc;

use axum::body::Body;
use dashmap::DashMap;
use http::{Request, Response};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::GroupConfig;
use crate::process::{Process, ProcessError};

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("model `{0}` is not a member of this group")]
    UnknownModel(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    Graceful,
    Immediate,
}

/// Governs mutual exclusion between the models in one group (spec.md §4.7).
pub struct ProcessGroup {
    pub id: String,
    config: GroupConfig,
    processes: DashMap<String, Arc<Process>>,
    /// Model ID of the last process this group actually served, set only
    /// after its proxied call returns (spec.md §5 ordering guarantee).
    last_used: Mutex<Option<String>>,
    /// Serializes the "stop old, start new" decision so at most one swap
    /// is ever in flight for this group (spec.md §4.7, §8).
    swap_lock: Mutex<()>,
}

impl ProcessGroup {
    pub fn new(id: impl Into<String>, config: GroupConfig) -> Self {
        Self {
            id: id.into(),
            config,
            processes: DashMap::new(),
            last_used: Mutex::new(None),
            swap_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn insert(&self, model_id: impl Into<String>, process: Arc<Process>) {
        self.processes.insert(model_id.into(), process);
    }

    pub fn remove(&self, model_id: &str) -> Option<Arc<Process>> {
        self.processes.remove(model_id).map(|(_, p)| p)
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<Process>> {
        self.processes.get(model_id).map(|e| Arc::clone(e.value()))
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.processes.iter().map(|e| e.key().clone()).collect()
    }

    /// Route one request to `model_id`, evicting the group's other active
    /// member first if policy calls for it (spec.md §4.7).
    ///
    /// Requests to the model that is *already* the group's active member
    /// skip the swap mutex entirely: only a genuine swap (or a race to
    /// start a second model concurrently) needs to serialize.
    pub async fn proxy_request(
        &self,
        model_id: &str,
        req: Request<Body>,
        cancel: CancellationToken,
    ) -> Result<Response<Body>, GroupError> {
        let process = self
            .get(model_id)
            .ok_or_else(|| GroupError::UnknownModel(model_id.to_string()))?;

        let currently_active = self.last_used.lock().await.clone();
        let is_active_already = currently_active.as_deref() == Some(model_id);

        let evicts_on_swap = self.config.exclusive && !self.config.persistent;

        let response = if self.config.swap && !is_active_already {
            let _swap_guard = self.swap_lock.lock().await;
            if evicts_on_swap {
                // Re-read under the lock: another swap may have completed
                // while we were waiting for it.
                let last = self.last_used.lock().await.clone();
                if let Some(last_model) = last {
                    if last_model != model_id {
                        if let Some(prev) = self.get(&last_model) {
                            debug!(group = %self.id, evicted = %last_model, "swapping group member");
                            prev.stop_graceful().await;
                        }
                    }
                }
            }
            // The swap lock is held through eviction and the proxied call's
            // header phase, then released here before body streaming
            // begins — concurrent requests to this same now-active model
            // never serialize on it (spec.md §4.7, §5).
            process.proxy_request(req, cancel).await?
        } else {
            process.proxy_request(req, cancel).await?
        };

        *self.last_used.lock().await = Some(model_id.to_string());
        Ok(response)
    }

    /// Stop every member in parallel.
    pub async fn stop_processes(&self, strategy: StopStrategy) {
        let processes: Vec<Arc<Process>> =
            self.processes.iter().map(|e| Arc::clone(e.value())).collect();
        let handles: Vec<_> = processes
            .into_iter()
            .map(|p| {
                tokio::spawn(async move {
                    match strategy {
                        StopStrategy::Graceful => p.stop_graceful().await,
                        StopStrategy::Immediate => p.stop_immediate().await,
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Stop every member and cancel their background tasks (idle timer,
    /// RPC health ticker); used on manager shutdown or when the group is
    /// removed entirely by a reload.
    pub async fn shutdown(&self) {
        self.stop_processes(StopStrategy::Graceful).await;
        for entry in self.processes.iter() {
            entry.value().shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::events::EventBus;
    use crate::logs::LogFanout;
    use std::time::Duration;

    fn test_model_config(proxy_port: u16) -> ModelConfig {
        ModelConfig {
            cmd: "sleep 100".into(),
            cmd_stop: None,
            proxy: Some(format!("http://127.0.0.1:{proxy_port}")),
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

    fn test_process(id: &str, port: u16) -> Arc<Process> {
        Process::new(
            id,
            test_model_config(port),
            Arc::new(LogFanout::with_capacity(1024)),
            EventBus::new(),
            reqwest::Client::new(),
            Duration::from_secs(15),
        )
    }

    #[tokio::test]
    async fn unknown_model_is_rejected() {
        let group = ProcessGroup::new("g1", GroupConfig::default());
        let req = Request::builder().uri("/v1/chat/completions").body(Body::empty()).unwrap();
        let err = group
            .proxy_request("ghost", req, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::UnknownModel(_)));
    }

    #[tokio::test]
    async fn member_ids_reflects_inserted_processes() {
        let group = ProcessGroup::new("g1", GroupConfig::default());
        let a = test_process("a", 6001);
        let b = test_process("b", 6002);
        group.insert("a", a);
        group.insert("b", b);
        let mut ids = group.member_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
