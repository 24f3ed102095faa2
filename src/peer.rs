//! Peer router: proxies requests for models hosted on a remote peer
//! instead of a local child process (spec.md §4.9).

use std::collections::{BTreeMap, HashMap};

use axum::body::Body;
use http::{HeaderValue, Request, Response, Uri};
use thiserror::Error;
use tracing::warn;

use crate::config::PeerConfig;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("model `{0}` is not claimed by any peer")]
    UnknownModel(String),
    #[error("peer `{peer}` has an invalid proxy URL `{url}`")]
    InvalidProxyUrl { peer: String, url: String },
    #[error("upstream request to peer failed: {0}")]
    Upstream(#[source] reqwest::Error),
    #[error("failed to build response")]
    BuildResponse,
}

struct PeerEntry {
    id: String,
    proxy_url: String,
    authority: String,
    api_key: Option<String>,
}

/// Maps model IDs to remote peers and proxies transparently (spec.md §4.9).
pub struct PeerRouter {
    model_to_peer: HashMap<String, usize>,
    peers: Vec<PeerEntry>,
    http_client: reqwest::Client,
}

impl PeerRouter {
    /// Traverses `peers` in sorted ID order (the map's own iteration order,
    /// since `Config::peers` is a `BTreeMap`); the first peer to claim a
    /// model wins, later claims are logged and skipped.
    pub fn new(peers: &BTreeMap<String, PeerConfig>, http_client: reqwest::Client) -> Self {
        let mut entries = Vec::new();
        let mut model_to_peer = HashMap::new();

        for (peer_id, peer_config) in peers {
            let authority = Uri::try_from(peer_config.proxy_url.as_str())
                .ok()
                .and_then(|uri| uri.authority().map(|a| a.to_string()))
                .unwrap_or_default();

            let index = entries.len();
            entries.push(PeerEntry {
                id: peer_id.clone(),
                proxy_url: peer_config.proxy_url.clone(),
                authority,
                api_key: peer_config.api_key.clone(),
            });

            for model_id in &peer_config.models {
                if model_to_peer.contains_key(model_id) {
                    warn!(
                        model = %model_id,
                        peer = %peer_id,
                        "model already claimed by an earlier peer, skipping"
                    );
                    continue;
                }
                model_to_peer.insert(model_id.clone(), index);
            }
        }

        Self {
            model_to_peer,
            peers: entries,
            http_client,
        }
    }

    pub fn hosts(&self, model_id: &str) -> bool {
        self.model_to_peer.contains_key(model_id)
    }

    pub async fn proxy_request(
        &self,
        model_id: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, PeerError> {
        let index = *self
            .model_to_peer
            .get(model_id)
            .ok_or_else(|| PeerError::UnknownModel(model_id.to_string()))?;
        let peer = &self.peers[index];

        if peer.authority.is_empty() {
            return Err(PeerError::InvalidProxyUrl {
                peer: peer.id.clone(),
                url: peer.proxy_url.clone(),
            });
        }

        let (parts, body) = req.into_parts();
        let path_and_query = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let url = format!("{}{}", peer.proxy_url.trim_end_matches('/'), path_and_query);

        let mut headers = parts.headers.clone();
        if let Ok(host_value) = HeaderValue::from_str(&peer.authority) {
            headers.insert(http::header::HOST, host_value);
        }
        if let Some(api_key) = &peer.api_key {
            if let Ok(auth_value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(http::header::AUTHORIZATION, auth_value);
            }
        }

        let body_stream = body.into_data_stream();
        let reqwest_body = reqwest::Body::wrap_stream(body_stream);

        let response = self
            .http_client
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(reqwest_body)
            .send()
            .await
            .map_err(PeerError::Upstream)?;

        let status = response.status();
        let mut resp_headers = response.headers().clone();

        let is_sse = resp_headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));
        if is_sse {
            resp_headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        }

        let body = Body::from_stream(response.bytes_stream());
        let mut builder = Response::builder().status(status);
        for (name, value) in resp_headers.iter() {
            builder = builder.header(name, value);
        }
        builder.body(body).map_err(|_| PeerError::BuildResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(entries: &[(&str, &str, Option<&str>, &[&str])]) -> BTreeMap<String, PeerConfig> {
        entries
            .iter()
            .map(|(id, url, key, models)| {
                (
                    id.to_string(),
                    PeerConfig {
                        proxy_url: url.to_string(),
                        api_key: key.map(|s| s.to_string()),
                        models: models.iter().map(|m| m.to_string()).collect(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn resolves_model_to_its_peer() {
        let cfg = peers(&[("p1", "http://10.0.0.1:8080", None, &["remote-a"])]);
        let router = PeerRouter::new(&cfg, reqwest::Client::new());
        assert!(router.hosts("remote-a"));
        assert!(!router.hosts("remote-b"));
    }

    #[test]
    fn first_peer_in_sorted_order_wins_a_claimed_model() {
        let cfg = peers(&[
            ("peer-b", "http://10.0.0.2:8080", None, &["shared"]),
            ("peer-a", "http://10.0.0.1:8080", None, &["shared"]),
        ]);
        let router = PeerRouter::new(&cfg, reqwest::Client::new());
        // BTreeMap iterates "peer-a" before "peer-b"; peer-a should win.
        let index = router.model_to_peer["shared"];
        assert_eq!(router.peers[index].id, "peer-a");
    }
}
