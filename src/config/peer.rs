//! Remote peer configuration (`PeerConfig`) — a model set hosted elsewhere.

use serde::{Deserialize, Serialize};

/// `{proxyURL, apiKey, models[]}` (spec.md §3.1).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PeerConfig {
    /// Base URL of the remote router/backend.
    #[serde(rename = "proxyURL")]
    pub proxy_url: String,

    /// Bearer token injected into `Authorization` when proxying to this
    /// peer. Unset means the inbound `Authorization` header is left alone.
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,

    /// Model IDs this peer claims to host.
    #[serde(default)]
    pub models: Vec<String>,
}
