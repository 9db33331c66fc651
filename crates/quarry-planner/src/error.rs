//! Error types for query planning.

use quarry_core::SchemaError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// An entity or relation path did not resolve.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A detail lookup key does not match the entity's primary key.
    #[error("invalid key for {entity}: {reason}")]
    InvalidKey { entity: String, reason: String },
}
