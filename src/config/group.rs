//! Process group policy (`GroupConfig`) — mutual exclusion between models.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// `{swap, exclusive, persistent, members[]}` (spec.md §3.1).
///
/// The three policy flags are independent booleans; every combination is
/// legal (spec.md §9 design notes).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GroupConfig {
    /// Stop the group's currently-active member before serving a different
    /// one.
    #[serde(default = "default_true")]
    pub swap: bool,

    /// At most one non-persistent member may run at a time.
    #[serde(default = "default_true")]
    pub exclusive: bool,

    /// Members in this group that are exempt from eviction on swap.
    #[serde(default)]
    pub persistent: bool,

    /// Model IDs belonging to this group.
    #[serde(default)]
    pub members: Vec<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            swap: true,
            exclusive: true,
            persistent: false,
            members: Vec::new(),
        }
    }
}

/// Name synthesized for the group that adopts orphan models (§4.2 step 5).
pub const DEFAULT_GROUP_ID: &str = "__default__";
