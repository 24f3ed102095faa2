//! Configuration loading, normalization, and hot-reload watching (spec.md §3.1, §4.2, §4.8).

pub mod group;
pub mod loader;
pub mod model;
pub mod peer;
pub mod watcher;

pub use group::{GroupConfig, DEFAULT_GROUP_ID};
pub use loader::{Config, ConfigError, RawConfig};
pub use model::ModelConfig;
pub use peer::PeerConfig;
pub use watcher::ConfigWatcher;
