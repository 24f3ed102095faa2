//! Per-model serving recipe (`ModelConfig`) and its YAML shape.

use serde::{Deserialize, Serialize};

fn default_check_endpoint() -> String {
    String::new()
}

/// Serving recipe for one model (spec.md §3.1).
///
/// Immutable after load for a given config generation; a reload replaces
/// the whole value rather than mutating fields in place.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelConfig {
    /// Command line used to launch the backend. May contain `${PORT}`.
    pub cmd: String,

    /// Optional override command used to stop the backend instead of
    /// signaling it. `${PID}` is substituted with the child's process id.
    #[serde(default, rename = "cmdStop")]
    pub cmd_stop: Option<String>,

    /// Explicit upstream URL. Required when `cmd` has no `${PORT}` token.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Alternate names this model answers to.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Extra environment assignments, each of the form `KEY=VALUE`.
    #[serde(default)]
    pub env: Vec<String>,

    /// Health-check path. `""` means `/health` (the default); `"none"`
    /// disables health probing entirely.
    #[serde(default = "default_check_endpoint", rename = "checkEndpoint")]
    pub check_endpoint: String,

    /// Seconds of inactivity before the backend is unloaded. `0` = never.
    #[serde(default)]
    pub ttl: u64,

    /// Whether to hide this model from `GET /v1/models`.
    #[serde(default)]
    pub unlisted: bool,

    /// Present this name to clients instead of the model's own config ID.
    #[serde(default, rename = "useModelName")]
    pub use_model_name: Option<String>,

    /// Maximum concurrent in-flight proxied requests. `0` = unbounded.
    #[serde(default, rename = "concurrencyLimit")]
    pub concurrency_limit: usize,

    /// Per-request timeout in seconds. `0`/unset = no timeout.
    #[serde(default, rename = "requestTimeout")]
    pub request_timeout: u64,

    /// Per-model override of the global restart-on-config-change flag.
    /// `None` defers to the global flag.
    #[serde(default, rename = "forceRestart")]
    pub force_restart: Option<bool>,

    /// Enable the independent RPC-endpoint liveness probe (§4.4.3).
    #[serde(default, rename = "rpcHealthCheck")]
    pub rpc_health_check: bool,
}

impl ModelConfig {
    /// Resolved health endpoint: `None` means probing is disabled.
    pub fn health_endpoint(&self) -> Option<&str> {
        match self.check_endpoint.as_str() {
            "none" => None,
            "" => Some("/health"),
            other => Some(other),
        }
    }

    /// The name a client should see when listing or echoing this model.
    pub fn display_name<'a>(&'a self, config_id: &'a str) -> &'a str {
        self.use_model_name.as_deref().unwrap_or(config_id)
    }

    /// Parsed `KEY=VALUE` environment assignments.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// `--rpc host:port[,host:port]*` endpoints declared on the command line,
    /// used to drive the independent RPC liveness probe (§4.4.3).
    pub fn rpc_endpoints(&self) -> Vec<String> {
        let mut tokens = self.cmd.split_whitespace().peekable();
        while let Some(tok) = tokens.next() {
            if tok == "--rpc" {
                if let Some(value) = tokens.next() {
                    return value.split(',').map(|s| s.to_string()).collect();
                }
            } else if let Some(value) = tok.strip_prefix("--rpc=") {
                return value.split(',').map(|s| s.to_string()).collect();
            }
        }
        Vec::new()
    }

    /// Fields whose change forces a process restart on reload (§4.8 step 3):
    /// command, stop command, proxy URL, environment, check endpoint,
    /// concurrency limit. TTL and alias changes alone never force a restart.
    pub fn restart_sensitive_diff(&self, other: &ModelConfig) -> bool {
        self.cmd != other.cmd
            || self.cmd_stop != other.cmd_stop
            || self.proxy != other.proxy
            || self.env != other.env
            || self.check_endpoint != other.check_endpoint
            || self.concurrency_limit != other.concurrency_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ModelConfig {
        ModelConfig {
            cmd: "llama-server --port ${PORT}".into(),
            cmd_stop: None,
            proxy: None,
            aliases: vec![],
            env: vec!["FOO=bar".into()],
            check_endpoint: String::new(),
            ttl: 0,
            unlisted: false,
            use_model_name: None,
            concurrency_limit: 0,
            request_timeout: 0,
            force_restart: None,
            rpc_health_check: false,
        }
    }

    #[test]
    fn empty_check_endpoint_defaults_to_health() {
        assert_eq!(base().health_endpoint(), Some("/health"));
    }

    #[test]
    fn none_check_endpoint_disables_probing() {
        let mut m = base();
        m.check_endpoint = "none".into();
        assert_eq!(m.health_endpoint(), None);
    }

    #[test]
    fn custom_check_endpoint_is_used_verbatim() {
        let mut m = base();
        m.check_endpoint = "/healthz".into();
        assert_eq!(m.health_endpoint(), Some("/healthz"));
    }

    #[test]
    fn display_name_falls_back_to_config_id() {
        let m = base();
        assert_eq!(m.display_name("my-model"), "my-model");
    }

    #[test]
    fn display_name_uses_override() {
        let mut m = base();
        m.use_model_name = Some("gpt-4".into());
        assert_eq!(m.display_name("my-model"), "gpt-4");
    }

    #[test]
    fn env_vars_parses_key_value_pairs() {
        let m = base();
        assert_eq!(m.env_vars(), vec![("FOO".to_string(), "bar".to_string())]);
    }

    #[test]
    fn rpc_endpoints_parsed_from_cmd() {
        let mut m = base();
        m.cmd = "llama-server --rpc 127.0.0.1:50052,127.0.0.1:50053 --port ${PORT}".into();
        assert_eq!(
            m.rpc_endpoints(),
            vec!["127.0.0.1:50052".to_string(), "127.0.0.1:50053".to_string()]
        );
    }

    #[test]
    fn rpc_endpoints_empty_when_absent() {
        assert!(base().rpc_endpoints().is_empty());
    }

    #[test]
    fn ttl_only_change_is_not_restart_sensitive() {
        let a = base();
        let mut b = base();
        b.ttl = 120;
        assert!(!a.restart_sensitive_diff(&b));
    }

    #[test]
    fn cmd_change_is_restart_sensitive() {
        let a = base();
        let mut b = base();
        b.cmd = "llama-server --port ${PORT} --extra".into();
        assert!(a.restart_sensitive_diff(&b));
    }

    #[test]
    fn alias_change_alone_is_not_restart_sensitive() {
        let a = base();
        let mut b = base();
        b.aliases = vec!["new-alias".into()];
        assert!(!a.restart_sensitive_diff(&b));
    }
}
