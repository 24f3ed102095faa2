//! modelmux - a process-group scheduler and HTTP proxy sitting in front of
//! on-demand inference backends (llama.cpp-server-shaped processes, local
//! or remote).
//!
//! # Design
//!
//! - **Contained startup**: backends are spawned on demand and torn down on
//!   idle TTL or explicit reload, never left running unsupervised.
//! - **Single source of truth**: one normalized [`config::Config`] generation
//!   drives every process group; a hot reload swaps it atomically.
//! - **Group arbitration**: models sharing a process group negotiate
//!   mutual exclusion so only one member's backend is resident at a time
//!   when the group calls for it.
//! - **Transparent proxying**: clients see an OpenAI-compatible surface
//!   regardless of whether a model is served locally or forwarded to a
//!   peer instance.

pub mod command;
pub mod config;
pub mod events;
pub mod group;
pub mod http;
pub mod logs;
pub mod manager;
pub mod metrics;
pub mod peer;
pub mod process;

pub use manager::Manager;
