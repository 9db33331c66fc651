//! Query planner configuration.

use serde::{Deserialize, Serialize};

/// Planner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Traversal-helper and history relations that are never eager-loaded,
    /// even when explicitly requested.
    #[serde(default = "default_eager_blacklist")]
    pub eager_blacklist: Vec<String>,

    /// Upper bound applied to any requested page size.
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            eager_blacklist: default_eager_blacklist(),
            max_limit: default_max_limit(),
        }
    }
}

impl PlannerConfig {
    pub fn is_blacklisted(&self, relation: &str) -> bool {
        self.eager_blacklist.iter().any(|r| r == relation)
    }
}

fn default_eager_blacklist() -> Vec<String> {
    [
        "ancestors",
        "ancestorsAndSelf",
        "descendants",
        "descendantsAndSelf",
        "siblings",
        "siblingsAndSelf",
        "bloodline",
        "parentAndSelf",
        "childrenAndSelf",
        "rootAncestor",
        "audits",
        "revisionHistory",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_limit() -> u64 {
    1000
}
