//! ACL configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclConfig {
    /// How long resolved ACL filters and grants stay cached.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Username looked up when a request carries no principal.
    #[serde(default = "default_anonymous_username")]
    pub anonymous_username: String,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl_seconds(),
            anonymous_username: default_anonymous_username(),
        }
    }
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_anonymous_username() -> String {
    "anonymous".to_string()
}
