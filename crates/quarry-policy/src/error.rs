//! Error types for authorization and ACL resolution.

use quarry_core::PermissionName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AclError {
    /// The principal lacks the permission entirely.
    #[error("principal '{principal}' is not authorized for {permission}")]
    Unauthorized {
        principal: String,
        permission: PermissionName,
    },

    /// The permission store failed.
    #[error("permission store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AclError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AclError::Unauthorized { .. })
    }
}
