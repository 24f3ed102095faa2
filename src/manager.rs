//! Top-level orchestrator: resolves a client-supplied model name to either a
//! local process group or a remote peer, and owns the config hot-reload
//! pipeline (spec.md §4.8, §4.9).

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use dashmap::DashMap;
use http::{Request, Response};
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, ConfigError, DEFAULT_GROUP_ID};
use crate::events::{Event, EventBus};
use crate::group::{GroupError, ProcessGroup};
use crate::logs::LogFanout;
use crate::metrics::MetricsMonitor;
use crate::peer::{PeerError, PeerRouter};
use crate::process::Process;

/// Fixed size of the in-memory token-metric history ring. Not part of the
/// YAML schema (spec.md §6.2 only lists top-level config keys); chosen as a
/// reasonable fixed default, same spirit as `process::DEFAULT_GRACEFUL_STOP_TIMEOUT`.
const METRICS_HISTORY_CAPACITY: usize = 2000;

/// Fixed byte budget for the request/response capture ring.
const CAPTURE_BYTE_BUDGET: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("model `{0}` is not known to this manager")]
    UnknownModel(String),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// One non-`unlisted` model entry for `GET /v1/models`.
#[derive(Debug, Clone)]
pub struct ModelListing {
    pub id: String,
    pub display_name: String,
}

enum RouteTarget {
    Local { group: Arc<ProcessGroup>, model_id: String },
    Peer,
}

/// Owns the live config, every process group, the peer router, the shared
/// log fan-out, and the metrics monitor. A reload atomically swaps the
/// config and reconciles groups/processes against it (spec.md §4.8).
pub struct Manager {
    config: RwLock<Arc<Config>>,
    groups: DashMap<String, Arc<ProcessGroup>>,
    peer_router: RwLock<Arc<PeerRouter>>,
    events: EventBus,
    shared_log: Arc<LogFanout>,
    http_client: reqwest::Client,
    metrics: Arc<MetricsMonitor>,
}

impl Manager {
    pub fn new(config: Config, shared_log: Arc<LogFanout>, http_client: reqwest::Client) -> Arc<Self> {
        let events = EventBus::new();
        let metrics = MetricsMonitor::new(METRICS_HISTORY_CAPACITY, CAPTURE_BYTE_BUDGET, true, events.clone());
        let peer_router = PeerRouter::new(&config.peers, http_client.clone());

        let groups: DashMap<String, Arc<ProcessGroup>> = DashMap::new();
        for (group_id, group_config) in &config.groups {
            groups.insert(group_id.clone(), Arc::new(ProcessGroup::new(group_id.clone(), group_config.clone())));
        }

        let health_check_timeout = Duration::from_secs(config.health_check_timeout_secs);
        for (model_id, model_config) in &config.models {
            let group_id = config.group_for_model(model_id).unwrap_or(DEFAULT_GROUP_ID);
            let Some(group) = groups.get(group_id).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let process = Process::new(
                model_id.clone(),
                model_config.clone(),
                Arc::clone(&shared_log),
                events.clone(),
                http_client.clone(),
                health_check_timeout,
            );
            group.insert(model_id.clone(), process);
        }

        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            groups,
            peer_router: RwLock::new(Arc::new(peer_router)),
            events,
            shared_log,
            http_client,
            metrics,
        })
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn shared_log(&self) -> Arc<LogFanout> {
        Arc::clone(&self.shared_log)
    }

    pub fn metrics(&self) -> Arc<MetricsMonitor> {
        Arc::clone(&self.metrics)
    }

    fn group_arc(&self, id: &str) -> Option<Arc<ProcessGroup>> {
        self.groups.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Every model visible to `GET /v1/models` (spec.md §6.1): everything in
    /// the active config except models flagged `unlisted`.
    pub fn model_listing(&self) -> Vec<ModelListing> {
        let config = self.config();
        config
            .models
            .iter()
            .filter(|(_, model)| !model.unlisted)
            .map(|(id, model)| ModelListing {
                id: id.clone(),
                display_name: model.display_name(id).to_string(),
            })
            .collect()
    }

    fn resolve(&self, name: &str) -> Option<RouteTarget> {
        let config = self.config();
        if let Some(model_id) = config.resolve_model(name) {
            if let Some(group_id) = config.group_for_model(model_id) {
                if let Some(group) = self.group_arc(group_id) {
                    return Some(RouteTarget::Local {
                        group,
                        model_id: model_id.to_string(),
                    });
                }
            }
        }
        if self.peer_router.read().hosts(name) {
            return Some(RouteTarget::Peer);
        }
        None
    }

    /// Route and proxy one request to the model named by `model_name`,
    /// wrapping local (non-peer) calls with token-usage metrics and capture
    /// (spec.md §4.9, §4.10). Peer-hosted requests are forwarded as-is:
    /// usage extraction belongs to whichever manager actually runs the
    /// backend.
    pub async fn proxy_request(
        self: &Arc<Self>,
        model_name: &str,
        req: Request<Body>,
        cancel: CancellationToken,
    ) -> Result<Response<Body>, ManagerError> {
        match self.resolve(model_name) {
            Some(RouteTarget::Local { group, model_id }) => {
                let metrics = self.metrics();
                let metrics_model_id = model_id.clone();
                metrics
                    .wrap_request(&metrics_model_id, req, move |req| {
                        let group = Arc::clone(&group);
                        let model_id = model_id.clone();
                        let cancel = cancel.clone();
                        async move { group.proxy_request(&model_id, req, cancel).await }
                    })
                    .await
                    .map_err(ManagerError::from)
            }
            Some(RouteTarget::Peer) => {
                let peer_router = Arc::clone(&self.peer_router.read());
                peer_router.proxy_request(model_name, req).await.map_err(ManagerError::from)
            }
            None => Err(ManagerError::UnknownModel(model_name.to_string())),
        }
    }

    /// Apply a newly-read config file (spec.md §4.8): diff against the
    /// current config per model, restart where required, relocate models
    /// whose group membership changed, create new models in stopped state,
    /// and stop+remove models no longer present.
    pub async fn reload(self: &Arc<Self>, yaml: &str) -> Result<(), ConfigError> {
        self.events.publish(Event::ReloadingStart);
        let result = self.reload_inner(yaml).await;
        self.events.publish(Event::ReloadingEnd { success: result.is_ok() });
        result
    }

    async fn reload_inner(self: &Arc<Self>, yaml: &str) -> Result<(), ConfigError> {
        let mut new_config = Config::from_yaml(yaml)?;
        let old_config = self.config();
        new_config.generation = old_config.generation + 1;
        let health_check_timeout = Duration::from_secs(new_config.health_check_timeout_secs);

        // Step 1: models removed entirely — stop and drop.
        for model_id in old_config.models.keys() {
            if new_config.models.contains_key(model_id) {
                continue;
            }
            let old_group_id = old_config.group_for_model(model_id).unwrap_or(DEFAULT_GROUP_ID);
            if let Some(group) = self.group_arc(old_group_id) {
                if let Some(process) = group.remove(model_id) {
                    process.stop_graceful().await;
                    process.shutdown();
                }
            }
        }

        // Step 2: every group referenced by the new config must exist.
        for (group_id, group_config) in &new_config.groups {
            if !self.groups.contains_key(group_id) {
                self.groups
                    .insert(group_id.clone(), Arc::new(ProcessGroup::new(group_id.clone(), group_config.clone())));
            }
        }

        // Step 3: models present in the new config — create, restart,
        // reconfigure in place, or relocate to a different group.
        for (model_id, new_model_config) in &new_config.models {
            let new_group_id = new_config.group_for_model(model_id).unwrap_or(DEFAULT_GROUP_ID);
            let Some(new_group) = self.group_arc(new_group_id) else {
                continue;
            };

            match old_config.models.get(model_id) {
                None => {
                    let process = Process::new(
                        model_id.clone(),
                        new_model_config.clone(),
                        Arc::clone(&self.shared_log),
                        self.events.clone(),
                        self.http_client.clone(),
                        health_check_timeout,
                    );
                    new_group.insert(model_id.clone(), process);
                }
                Some(_old_model_config) => {
                    let old_group_id = old_config.group_for_model(model_id).unwrap_or(DEFAULT_GROUP_ID);
                    let existing = self.group_arc(old_group_id).and_then(|g| g.get(model_id));

                    if old_config.needs_restart(&new_config, model_id) {
                        if let Some(process) = &existing {
                            process.stop_graceful().await;
                            process.shutdown();
                        }
                        if let Some(old_group) = self.group_arc(old_group_id) {
                            old_group.remove(model_id);
                        }
                        info!(model = %model_id, "restart-sensitive config change, recreating process");
                        let fresh = Process::new(
                            model_id.clone(),
                            new_model_config.clone(),
                            Arc::clone(&self.shared_log),
                            self.events.clone(),
                            self.http_client.clone(),
                            health_check_timeout,
                        );
                        new_group.insert(model_id.clone(), fresh);
                    } else if let Some(process) = existing {
                        process.update_config(new_model_config.clone());
                        if old_group_id != new_group_id {
                            if let Some(old_group) = self.group_arc(old_group_id) {
                                old_group.remove(model_id);
                            }
                            new_group.insert(model_id.clone(), process);
                        }
                    } else {
                        // Config listed the model before but no process was
                        // ever created for it; tolerate by creating fresh.
                        let fresh = Process::new(
                            model_id.clone(),
                            new_model_config.clone(),
                            Arc::clone(&self.shared_log),
                            self.events.clone(),
                            self.http_client.clone(),
                            health_check_timeout,
                        );
                        new_group.insert(model_id.clone(), fresh);
                    }
                }
            }
        }

        // Step 4: groups no longer referenced by the new config.
        let stale_group_ids: Vec<String> = self
            .groups
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !new_config.groups.contains_key(id))
            .collect();
        for group_id in stale_group_ids {
            if let Some((_, group)) = self.groups.remove(&group_id) {
                group.shutdown().await;
            }
        }

        *self.peer_router.write() = Arc::new(PeerRouter::new(&new_config.peers, self.http_client.clone()));
        *self.config.write() = Arc::new(new_config);
        Ok(())
    }

    /// Stop every process in every group and cancel their background tasks;
    /// used on process shutdown (spec.md §4.4.4 applies per-process, this
    /// just fans it out).
    pub async fn shutdown(&self) {
        let groups: Vec<Arc<ProcessGroup>> = self.groups.iter().map(|e| Arc::clone(e.value())).collect();
        for group in groups {
            group.shutdown().await;
        }
    }
}
