//! Error types for writes and CRUD orchestration.

use quarry_planner::PlanError;
use quarry_policy::AclError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// The guarded UPDATE affected no row: another writer advanced the
    /// version first, or the row is gone. Never retried here.
    #[error("stale record {entity} {key}: expected lock version {}", version_label(.expected))]
    StaleLockingConflict {
        entity: String,
        key: String,
        expected: Option<i64>,
    },

    /// The record was never stored or has been deleted.
    #[error("record of {entity} is not persisted")]
    NotPersisted { entity: String },

    /// Another principal holds the ownership lock.
    #[error("record of {entity} is locked by {holder}")]
    LockedByOther { entity: String, holder: String },

    #[error("row store error: {0}")]
    Store(#[from] anyhow::Error),
}

fn version_label(version: &Option<i64>) -> String {
    version.map_or_else(|| "none".to_string(), |v| v.to_string())
}

impl LockError {
    pub fn is_stale(&self) -> bool {
        matches!(self, LockError::StaleLockingConflict { .. })
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Acl(#[from] AclError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{entity} {key} not found")]
    NotFound { entity: String, key: String },

    #[error("query execution failed: {0}")]
    Store(#[from] anyhow::Error),
}

impl From<quarry_core::SchemaError> for ServiceError {
    fn from(err: quarry_core::SchemaError) -> Self {
        ServiceError::Plan(PlanError::Schema(err))
    }
}
