//! Error types for schema resolution.

use thiserror::Error;

/// Errors raised while building the relation registry or resolving paths
/// through it during query compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// No entity with this name is declared.
    #[error("unknown entity '{entity}'")]
    UnknownEntity { entity: String },

    /// A relation path segment does not resolve through the entity graph.
    #[error("relation '{relation}' not found on entity '{entity}'")]
    RelationNotFound { entity: String, relation: String },

    /// Inverse-relation resolution found more than one candidate.
    #[error(
        "relation '{entity}.{relation}' is ambiguous: candidates {}",
        .candidates.join(", ")
    )]
    AmbiguousRelation {
        entity: String,
        relation: String,
        candidates: Vec<String>,
    },

    /// A relation key was not declared and could not be inferred.
    #[error("cannot resolve {key} for relation '{entity}.{relation}'")]
    UnresolvedRelationKey {
        entity: String,
        relation: String,
        key: &'static str,
    },

    /// The schema definition itself is inconsistent.
    #[error("invalid schema definition: {0}")]
    InvalidDefinition(String),
}

impl SchemaError {
    pub fn unknown_entity(entity: &str) -> Self {
        SchemaError::UnknownEntity {
            entity: entity.to_string(),
        }
    }

    pub fn relation_not_found(entity: &str, relation: &str) -> Self {
        SchemaError::RelationNotFound {
            entity: entity.to_string(),
            relation: relation.to_string(),
        }
    }
}
