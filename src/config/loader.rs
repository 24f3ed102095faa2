//! Top-level configuration: the validated, normalized in-memory description
//! of all models, groups, and peers (spec.md §3.1, §4.2).

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::group::{GroupConfig, DEFAULT_GROUP_ID};
use super::model::ModelConfig;
use super::peer::PeerConfig;
use crate::command;

const MIN_HEALTH_CHECK_TIMEOUT: u64 = 15;
const DEFAULT_START_PORT: u16 = 5800;

fn default_start_port() -> u16 {
    DEFAULT_START_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_restart_on_change() -> bool {
    true
}

/// Raw, as-deserialized config shape (spec.md §6.2). Not yet normalized or
/// validated — use [`Config::from_yaml`] to obtain a usable [`Config`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    #[serde(default, rename = "healthCheckTimeout")]
    pub health_check_timeout: Option<u64>,

    #[serde(default, rename = "logRequests")]
    pub log_requests: bool,

    #[serde(default = "default_log_level", rename = "logLevel")]
    pub log_level: String,

    #[serde(default = "default_start_port", rename = "startPort")]
    pub start_port: u16,

    /// Global default for whether a restart-sensitive config change
    /// actually restarts the affected process; overridable per model via
    /// `ModelConfig::force_restart` (spec.md §4.8 step 3).
    #[serde(default = "default_restart_on_change", rename = "restartOnConfigChange")]
    pub restart_on_change: bool,

    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,

    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,

    #[serde(default)]
    pub peers: BTreeMap<String, PeerConfig>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("startPort must be >= 1, got {0}")]
    InvalidStartPort(u16),

    #[error("alias `{alias}` is claimed by both `{first}` and `{second}`")]
    DuplicateAlias {
        alias: String,
        first: String,
        second: String,
    },

    #[error("model `{0}` has no ${{PORT}} token in its command and no explicit proxy URL")]
    MissingPortOrProxy(String),

    #[error("model `{model}` is a member of both group `{first}` and group `{second}`")]
    DuplicateGroupMembership {
        model: String,
        first: String,
        second: String,
    },

    #[error("group `{group}` lists unknown model `{model}` as a member")]
    UnknownGroupMember { group: String, model: String },

    #[error("invalid command for model `{model}`: {source}")]
    InvalidCommand {
        model: String,
        #[source]
        source: command::CommandParseError,
    },
}

/// Validated, normalized top-level configuration (spec.md §3.1).
#[derive(Debug, Clone)]
pub struct Config {
    pub health_check_timeout_secs: u64,
    pub log_requests: bool,
    pub log_level: String,
    pub start_port: u16,
    pub restart_on_change: bool,
    pub models: BTreeMap<String, ModelConfig>,
    pub groups: BTreeMap<String, GroupConfig>,
    pub peers: BTreeMap<String, PeerConfig>,
    /// Derived alias/canonical-id → model-id map (injective, spec.md §3.2).
    pub alias_to_model: HashMap<String, String>,
    /// Derived model-id → owning-group-id map.
    pub model_to_group: HashMap<String, String>,
    /// Bumped by the manager on every successful reload.
    pub generation: u64,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|e| {
            // Surface YAML parse errors as a missing-port error is wrong;
            // normalize() only runs on a successfully-deserialized raw
            // config, so a parse failure is reported directly here.
            ConfigError::MissingPortOrProxy(format!("failed to parse config: {e}"))
        })?;
        Self::normalize(raw)
    }

    /// Apply the §4.2 normalization pipeline, in order, to a raw config.
    pub fn normalize(mut raw: RawConfig) -> Result<Self, ConfigError> {
        // 1. Raise healthCheckTimeout to at least 15s.
        let health_check_timeout_secs = raw
            .health_check_timeout
            .unwrap_or(MIN_HEALTH_CHECK_TIMEOUT)
            .max(MIN_HEALTH_CHECK_TIMEOUT);

        // 2. Default/validate startPort.
        if raw.start_port < 1 {
            return Err(ConfigError::InvalidStartPort(raw.start_port));
        }
        let start_port = raw.start_port;

        // 3. Build alias map; reject duplicates. Every model's own ID is
        // also a resolvable "alias" of itself.
        let mut alias_to_model: HashMap<String, String> = HashMap::new();
        for (model_id, model) in &raw.models {
            if let Some(prev) = alias_to_model.insert(model_id.clone(), model_id.clone()) {
                if prev != *model_id {
                    return Err(ConfigError::DuplicateAlias {
                        alias: model_id.clone(),
                        first: prev,
                        second: model_id.clone(),
                    });
                }
            }
            for alias in &model.aliases {
                if let Some(prev) = alias_to_model.insert(alias.clone(), model_id.clone()) {
                    if prev != *model_id {
                        return Err(ConfigError::DuplicateAlias {
                            alias: alias.clone(),
                            first: prev,
                            second: model_id.clone(),
                        });
                    }
                }
            }
        }

        // 4. Port substitution in sorted model-ID order (BTreeMap already
        // iterates in sorted key order).
        let mut port = start_port;
        for (model_id, model) in raw.models.iter_mut() {
            command::tokenize(&model.cmd).map_err(|source| ConfigError::InvalidCommand {
                model: model_id.clone(),
                source,
            })?;

            let has_port_token = model.cmd.contains("${PORT}")
                || model.proxy.as_deref().is_some_and(|p| p.contains("${PORT}"));

            if !has_port_token && model.proxy.is_none() {
                return Err(ConfigError::MissingPortOrProxy(model_id.clone()));
            }

            if has_port_token {
                model.cmd = command::substitute_port(&model.cmd, port);
                if let Some(proxy) = model.proxy.as_mut() {
                    *proxy = command::substitute_port(proxy, port);
                } else {
                    model.proxy = Some(format!("http://127.0.0.1:{port}"));
                }
                port += 1;
            }

            // On Windows, an unset cmdStop gets the `taskkill` default
            // (spec.md §4.4.4) so a model's declared override always wins.
            #[cfg(windows)]
            if model.cmd_stop.is_none() {
                model.cmd_stop = Some(crate::process::stop::default_windows_cmd_stop().to_string());
            }
        }

        // 5. Ensure every model belongs to exactly one group; synthesize a
        // default group for the remainder.
        let mut model_to_group: HashMap<String, String> = HashMap::new();
        for (group_id, group) in &raw.groups {
            for member in &group.members {
                if !raw.models.contains_key(member) {
                    return Err(ConfigError::UnknownGroupMember {
                        group: group_id.clone(),
                        model: member.clone(),
                    });
                }
                if let Some(prev) = model_to_group.insert(member.clone(), group_id.clone()) {
                    return Err(ConfigError::DuplicateGroupMembership {
                        model: member.clone(),
                        first: prev,
                        second: group_id.clone(),
                    });
                }
            }
        }

        let assigned: HashSet<&String> = model_to_group.keys().collect();
        let mut orphans: Vec<String> = raw
            .models
            .keys()
            .filter(|id| !assigned.contains(id))
            .cloned()
            .collect();
        orphans.sort();

        if !orphans.is_empty() {
            for orphan in &orphans {
                model_to_group.insert(orphan.clone(), DEFAULT_GROUP_ID.to_string());
            }
            raw.groups.insert(
                DEFAULT_GROUP_ID.to_string(),
                GroupConfig {
                    swap: true,
                    exclusive: true,
                    persistent: false,
                    members: orphans,
                },
            );
        }

        Ok(Config {
            health_check_timeout_secs,
            log_requests: raw.log_requests,
            log_level: raw.log_level,
            start_port,
            restart_on_change: raw.restart_on_change,
            models: raw.models,
            groups: raw.groups,
            peers: raw.peers,
            alias_to_model,
            model_to_group,
            generation: 0,
        })
    }

    /// Resolve a client-supplied model name to its canonical model ID via
    /// the alias map.
    pub fn resolve_model(&self, name: &str) -> Option<&str> {
        self.alias_to_model.get(name).map(|s| s.as_str())
    }

    /// The group owning a canonical model ID.
    pub fn group_for_model(&self, model_id: &str) -> Option<&str> {
        self.model_to_group.get(model_id).map(|s| s.as_str())
    }

    /// Whether `model_id`'s process should be restarted going from `self`
    /// (old config) to `new` (spec.md §4.8 step 3): the effective flag
    /// (`forceRestart` overriding the global default) must be true *and*
    /// a restart-sensitive field must actually have changed.
    pub fn needs_restart(&self, new: &Config, model_id: &str) -> bool {
        let (Some(old_model), Some(new_model)) = (self.models.get(model_id), new.models.get(model_id)) else {
            return false;
        };
        let effective_flag = new_model.force_restart.unwrap_or(new.restart_on_change);
        effective_flag && old_model.restart_sensitive_diff(new_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        Config::from_yaml(yaml)
    }

    #[test]
    fn health_check_timeout_floored_at_15() {
        let cfg = parse("healthCheckTimeout: 3\nmodels: {}\n").unwrap();
        assert_eq!(cfg.health_check_timeout_secs, 15);
    }

    #[test]
    fn health_check_timeout_above_floor_is_kept() {
        let cfg = parse("healthCheckTimeout: 30\nmodels: {}\n").unwrap();
        assert_eq!(cfg.health_check_timeout_secs, 30);
    }

    #[test]
    fn start_port_defaults_to_5800() {
        let cfg = parse("models: {}\n").unwrap();
        assert_eq!(cfg.start_port, 5800);
    }

    #[test]
    fn start_port_zero_is_rejected() {
        let err = parse("startPort: 0\nmodels: {}\n").unwrap_err();
        assert_eq!(err, ConfigError::InvalidStartPort(0));
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let yaml = r#"
models:
  a:
    cmd: "cmd-a --port ${PORT}"
    aliases: [shared]
  b:
    cmd: "cmd-b --port ${PORT}"
    aliases: [shared]
"#;
        assert!(matches!(parse(yaml), Err(ConfigError::DuplicateAlias { .. })));
    }

    #[test]
    fn model_without_port_token_or_proxy_is_rejected() {
        let yaml = r#"
models:
  a:
    cmd: "cmd-a --no-port-here"
"#;
        assert_eq!(
            parse(yaml).unwrap_err(),
            ConfigError::MissingPortOrProxy("a".to_string())
        );
    }

    #[test]
    fn model_with_explicit_proxy_and_no_port_token_is_accepted() {
        let yaml = r#"
models:
  a:
    cmd: "cmd-a --no-port-here"
    proxy: "http://localhost:9999"
"#;
        let cfg = parse(yaml).unwrap();
        assert_eq!(cfg.models["a"].proxy.as_deref(), Some("http://localhost:9999"));
    }

    #[test]
    fn ports_assigned_in_sorted_model_id_order() {
        let yaml = r#"
startPort: 6000
models:
  zeta:
    cmd: "cmd-zeta --port ${PORT}"
  alpha:
    cmd: "cmd-alpha --port ${PORT}"
"#;
        let cfg = parse(yaml).unwrap();
        assert!(cfg.models["alpha"].cmd.contains("6000"));
        assert!(cfg.models["zeta"].cmd.contains("6001"));
    }

    #[test]
    fn port_substitution_is_deterministic() {
        let yaml = r#"
startPort: 7000
models:
  a:
    cmd: "cmd-a --port ${PORT}"
  b:
    cmd: "cmd-b --port ${PORT}"
"#;
        let cfg1 = parse(yaml).unwrap();
        let cfg2 = parse(yaml).unwrap();
        assert_eq!(cfg1.models["a"].cmd, cfg2.models["a"].cmd);
        assert_eq!(cfg1.models["b"].cmd, cfg2.models["b"].cmd);
    }

    #[test]
    fn orphan_models_adopted_into_default_group() {
        let yaml = r#"
models:
  a:
    cmd: "cmd-a --port ${PORT}"
  b:
    cmd: "cmd-b --port ${PORT}"
"#;
        let cfg = parse(yaml).unwrap();
        assert_eq!(cfg.group_for_model("a"), Some(DEFAULT_GROUP_ID));
        assert_eq!(cfg.group_for_model("b"), Some(DEFAULT_GROUP_ID));
        let default_group = &cfg.groups[DEFAULT_GROUP_ID];
        assert_eq!(default_group.members, vec!["a", "b"]);
        assert!(default_group.swap);
        assert!(default_group.exclusive);
    }

    #[test]
    fn duplicate_group_membership_is_rejected() {
        let yaml = r#"
models:
  a:
    cmd: "cmd-a --port ${PORT}"
groups:
  g1:
    members: [a]
  g2:
    members: [a]
"#;
        assert!(matches!(
            parse(yaml),
            Err(ConfigError::DuplicateGroupMembership { .. })
        ));
    }

    #[test]
    fn group_member_must_reference_known_model() {
        let yaml = r#"
models:
  a:
    cmd: "cmd-a --port ${PORT}"
groups:
  g1:
    members: [a, ghost]
"#;
        assert!(matches!(
            parse(yaml),
            Err(ConfigError::UnknownGroupMember { .. })
        ));
    }

    #[test]
    fn restart_on_change_defaults_to_true() {
        let cfg = parse("models: {}\n").unwrap();
        assert!(cfg.restart_on_change);
    }

    #[test]
    fn needs_restart_when_cmd_changes_and_global_flag_true() {
        let old = parse("models:\n  a:\n    cmd: \"old --port ${PORT}\"\n").unwrap();
        let new = parse("models:\n  a:\n    cmd: \"new --port ${PORT}\"\n").unwrap();
        assert!(old.needs_restart(&new, "a"));
    }

    #[test]
    fn no_restart_when_only_ttl_changes() {
        let old = parse("models:\n  a:\n    cmd: \"x --port ${PORT}\"\n    ttl: 60\n").unwrap();
        let new = parse("models:\n  a:\n    cmd: \"x --port ${PORT}\"\n    ttl: 120\n").unwrap();
        assert!(!old.needs_restart(&new, "a"));
    }

    #[test]
    fn no_restart_when_global_flag_false_and_force_restart_unset() {
        let old =
            parse("restartOnConfigChange: false\nmodels:\n  a:\n    cmd: \"old --port ${PORT}\"\n").unwrap();
        let new =
            parse("restartOnConfigChange: false\nmodels:\n  a:\n    cmd: \"new --port ${PORT}\"\n").unwrap();
        assert!(!old.needs_restart(&new, "a"));
    }

    #[test]
    fn force_restart_true_overrides_global_flag_false() {
        let old =
            parse("restartOnConfigChange: false\nmodels:\n  a:\n    cmd: \"old --port ${PORT}\"\n").unwrap();
        let new = parse(
            "restartOnConfigChange: false\nmodels:\n  a:\n    cmd: \"new --port ${PORT}\"\n    forceRestart: true\n",
        )
        .unwrap();
        assert!(old.needs_restart(&new, "a"));
    }

    #[test]
    fn resolve_model_follows_alias() {
        let yaml = r#"
models:
  m1:
    cmd: "cmd --port ${PORT}"
    aliases: [m-one, one]
"#;
        let cfg = parse(yaml).unwrap();
        assert_eq!(cfg.resolve_model("one"), Some("m1"));
        assert_eq!(cfg.resolve_model("m-one"), Some("m1"));
        assert_eq!(cfg.resolve_model("m1"), Some("m1"));
        assert_eq!(cfg.resolve_model("m2"), None);
    }
}
