//! Lock column configuration.

use serde::{Deserialize, Serialize};

/// Column names used for optimistic versioning and ownership locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Integer column incremented by exactly one per successful update.
    #[serde(default = "default_version_column")]
    pub version_column: String,

    /// Timestamp of the current ownership lock.
    #[serde(default = "default_locked_at_column")]
    pub locked_at_column: String,

    /// Principal holding the current ownership lock.
    #[serde(default = "default_locked_by_column")]
    pub locked_by_column: String,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            version_column: default_version_column(),
            locked_at_column: default_locked_at_column(),
            locked_by_column: default_locked_by_column(),
        }
    }
}

fn default_version_column() -> String {
    "lock_version".to_string()
}

fn default_locked_at_column() -> String {
    "locked_at".to_string()
}

fn default_locked_by_column() -> String {
    "locked_user_id".to_string()
}
