//! Schema metadata and the relation registry.
//!
//! Entities are declared once (from YAML or database introspection) as a
//! [`SchemaDefinition`]. [`SchemaRegistry::build`] resolves every relation's
//! keys up front, so request-time code only ever reads immutable
//! [`RelationDescriptor`]s.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SchemaError;

// =============================================================================
// COLUMNS & KEYS
// =============================================================================

/// Schema information for a table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,

    /// SQL data type.
    #[serde(default = "default_data_type")]
    pub data_type: String,

    #[serde(default = "default_true")]
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
        }
    }
}

/// A foreign-key constraint as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    #[serde(default)]
    pub name: String,
    pub columns: Vec<String>,
    pub references: ForeignKeyTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyTarget {
    pub table: String,
    pub columns: Vec<String>,
}

// =============================================================================
// RELATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
    BelongsToMany,
    HasOneThrough,
    HasManyThrough,
}

impl RelationKind {
    /// Relations joined through an intermediate table.
    pub fn uses_pivot(self) -> bool {
        matches!(
            self,
            RelationKind::BelongsToMany | RelationKind::HasOneThrough | RelationKind::HasManyThrough
        )
    }

    /// Relations that yield at most one related row per parent.
    pub fn is_single(self) -> bool {
        matches!(
            self,
            RelationKind::BelongsTo | RelationKind::HasOne | RelationKind::HasOneThrough
        )
    }

    fn inverse_kinds(self) -> &'static [RelationKind] {
        match self {
            RelationKind::BelongsTo => &[RelationKind::HasOne, RelationKind::HasMany],
            RelationKind::HasOne | RelationKind::HasMany => &[RelationKind::BelongsTo],
            RelationKind::BelongsToMany => &[RelationKind::BelongsToMany],
            RelationKind::HasOneThrough | RelationKind::HasManyThrough => &[],
        }
    }
}

/// Intermediate table of a many-to-many or through relation.
///
/// `local_pivot_key` matches the declaring entity's `local_key`,
/// `related_pivot_key` matches the related entity's `foreign_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivotDescriptor {
    pub table: String,
    pub local_pivot_key: String,
    pub related_pivot_key: String,
}

impl PivotDescriptor {
    fn swapped(&self) -> Self {
        Self {
            table: self.table.clone(),
            local_pivot_key: self.related_pivot_key.clone(),
            related_pivot_key: self.local_pivot_key.clone(),
        }
    }
}

/// A relation as written in a schema definition. Keys may be omitted and
/// are then inferred when the registry is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    pub kind: RelationKind,
    pub related: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot: Option<PivotDescriptor>,
}

/// A fully resolved relation.
///
/// `local_key` always lives on the declaring entity and `foreign_key` on the
/// related entity. For `belongs_to` that makes `local_key` the referencing
/// column and `foreign_key` the owner key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub name: String,
    pub kind: RelationKind,
    pub related: String,
    pub local_key: String,
    pub foreign_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot: Option<PivotDescriptor>,
}

// =============================================================================
// ENTITIES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampColumns {
    #[serde(default = "default_created_at")]
    pub created_at: String,
    #[serde(default = "default_updated_at")]
    pub updated_at: String,
}

impl Default for TimestampColumns {
    fn default() -> Self {
        Self {
            created_at: default_created_at(),
            updated_at: default_updated_at(),
        }
    }
}

/// Optional behaviours attached to an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Soft-delete column; rows with a non-null value are hidden by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_deletes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<TimestampColumns>,

    /// Updates are guarded by the configured lock-version column.
    #[serde(default)]
    pub lockable: bool,
}

/// An entity as written in a schema definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
    #[serde(default = "default_primary_key")]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
    #[serde(default, flatten)]
    pub capabilities: Capabilities,
}

/// Root of a schema YAML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
}

impl SchemaDefinition {
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

/// Resolved, read-only metadata for one entity (table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub connection: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub relations: Vec<RelationDescriptor>,
    pub capabilities: Capabilities,
}

impl EntitySchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|pk| pk == column)
    }

    pub fn soft_delete_column(&self) -> Option<&str> {
        self.capabilities.soft_deletes.as_deref()
    }

    pub fn timestamps(&self) -> Option<&TimestampColumns> {
        self.capabilities.timestamps.as_ref()
    }

    pub fn is_lockable(&self) -> bool {
        self.capabilities.lockable
    }

    /// Every column that takes part in a foreign-key constraint.
    pub fn foreign_key_columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for fk in &self.foreign_keys {
            for col in &fk.columns {
                if !out.contains(&col.as_str()) {
                    out.push(col);
                }
            }
        }
        out
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// One step of a resolved relation path.
#[derive(Debug, Clone, Copy)]
pub struct RelationHop<'a> {
    pub parent: &'a EntitySchema,
    pub relation: &'a RelationDescriptor,
    pub related: &'a EntitySchema,
}

/// Immutable registry of entities and their resolved relations.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entities: HashMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    /// Resolve a schema definition into a registry.
    ///
    /// Every relation key is settled here; nothing is inferred at call time.
    pub fn build(
        definition: SchemaDefinition,
        default_connection: &str,
    ) -> Result<Self, SchemaError> {
        let mut by_name: HashMap<&str, &EntityDefinition> = HashMap::new();
        for entity in &definition.entities {
            if by_name.insert(entity.name.as_str(), entity).is_some() {
                return Err(SchemaError::InvalidDefinition(format!(
                    "entity '{}' declared twice",
                    entity.name
                )));
            }
            if entity.primary_key.is_empty() {
                return Err(SchemaError::InvalidDefinition(format!(
                    "entity '{}' has no primary key",
                    entity.name
                )));
            }
        }

        let mut entities = HashMap::new();
        for entity in &definition.entities {
            let mut relations = Vec::with_capacity(entity.relations.len());
            for relation in &entity.relations {
                let related = by_name.get(relation.related.as_str()).ok_or_else(|| {
                    SchemaError::InvalidDefinition(format!(
                        "relation '{}.{}' points to unknown entity '{}'",
                        entity.name, relation.name, relation.related
                    ))
                })?;
                relations.push(resolve_relation(entity, relation, related)?);
            }

            let schema = EntitySchema {
                name: entity.name.clone(),
                connection: entity
                    .connection
                    .clone()
                    .unwrap_or_else(|| default_connection.to_string()),
                columns: entity.columns.clone(),
                primary_key: entity.primary_key.clone(),
                foreign_keys: entity.foreign_keys.clone(),
                relations,
                capabilities: entity.capabilities.clone(),
            };
            tracing::debug!(
                entity = %schema.name,
                relations = schema.relations.len(),
                "registered entity"
            );
            entities.insert(schema.name.clone(), Arc::new(schema));
        }

        Ok(Self { entities })
    }

    pub fn entity(&self, name: &str) -> Result<&EntitySchema, SchemaError> {
        self.entities
            .get(name)
            .map(|e| e.as_ref())
            .ok_or_else(|| SchemaError::unknown_entity(name))
    }

    /// Shared handle to an entity's metadata.
    pub fn get(&self, name: &str) -> Option<Arc<EntitySchema>> {
        self.entities.get(name).cloned()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.values().map(|e| e.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Resolve one relation hop from `entity`.
    pub fn relation<'a>(
        &'a self,
        entity: &'a EntitySchema,
        name: &str,
    ) -> Result<RelationHop<'a>, SchemaError> {
        let relation = entity
            .relation(name)
            .ok_or_else(|| SchemaError::relation_not_found(&entity.name, name))?;
        let related = self.entity(&relation.related)?;
        Ok(RelationHop {
            parent: entity,
            relation,
            related,
        })
    }

    /// Walk a dotted relation path (`customer.address`) hop by hop.
    pub fn resolve_path<'a>(
        &'a self,
        entity: &str,
        path: &str,
    ) -> Result<Vec<RelationHop<'a>>, SchemaError> {
        let mut current = self.entity(entity)?;
        let mut hops = Vec::new();
        for segment in path.split('.') {
            let hop = self.relation(current, segment)?;
            current = hop.related;
            hops.push(hop);
        }
        Ok(hops)
    }

    /// Find the relation on the related entity that points back along the
    /// same keys.
    pub fn inverse_of(
        &self,
        entity: &str,
        relation: &str,
    ) -> Result<Option<&RelationDescriptor>, SchemaError> {
        let parent = self.entity(entity)?;
        let hop = self.relation(parent, relation)?;
        let candidates: Vec<&RelationDescriptor> = hop
            .related
            .relations
            .iter()
            .filter(|inv| {
                inv.related == parent.name
                    && hop.relation.kind.inverse_kinds().contains(&inv.kind)
                    && inv.local_key == hop.relation.foreign_key
                    && inv.foreign_key == hop.relation.local_key
            })
            .collect();

        match candidates.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            many => Err(SchemaError::AmbiguousRelation {
                entity: entity.to_string(),
                relation: relation.to_string(),
                candidates: many
                    .iter()
                    .map(|r| format!("{}.{}", hop.related.name, r.name))
                    .collect(),
            }),
        }
    }
}

fn resolve_relation(
    entity: &EntityDefinition,
    relation: &RelationDefinition,
    related: &EntityDefinition,
) -> Result<RelationDescriptor, SchemaError> {
    let unresolved = |key: &'static str| SchemaError::UnresolvedRelationKey {
        entity: entity.name.clone(),
        relation: relation.name.clone(),
        key,
    };

    let (local_key, foreign_key, pivot) = match relation.kind {
        RelationKind::BelongsTo => {
            let local_key = match &relation.local_key {
                Some(key) => key.clone(),
                None => infer_from_inverse(entity, relation, related, |inv| inv.foreign_key.clone())?
                    .or_else(|| single_fk_column(entity, &related.name))
                    .ok_or_else(|| unresolved("local_key"))?,
            };
            let foreign_key = match &relation.foreign_key {
                Some(key) => key.clone(),
                None => single_pk(related).ok_or_else(|| unresolved("foreign_key"))?,
            };
            (local_key, foreign_key, None)
        }
        RelationKind::HasOne | RelationKind::HasMany => {
            let local_key = match &relation.local_key {
                Some(key) => key.clone(),
                None => single_pk(entity).ok_or_else(|| unresolved("local_key"))?,
            };
            let foreign_key = match &relation.foreign_key {
                Some(key) => key.clone(),
                None => infer_from_inverse(entity, relation, related, |inv| inv.local_key.clone())?
                    .or_else(|| single_fk_column(related, &entity.name))
                    .ok_or_else(|| unresolved("foreign_key"))?,
            };
            (local_key, foreign_key, None)
        }
        RelationKind::BelongsToMany => {
            let local_key = match &relation.local_key {
                Some(key) => key.clone(),
                None => single_pk(entity).ok_or_else(|| unresolved("local_key"))?,
            };
            let foreign_key = match &relation.foreign_key {
                Some(key) => key.clone(),
                None => single_pk(related).ok_or_else(|| unresolved("foreign_key"))?,
            };
            let pivot = match &relation.pivot {
                Some(pivot) => pivot.clone(),
                None => infer_from_inverse(entity, relation, related, |inv| {
                    inv.pivot.as_ref().map(PivotDescriptor::swapped)
                })?
                .ok_or_else(|| unresolved("pivot"))?,
            };
            (local_key, foreign_key, Some(pivot))
        }
        RelationKind::HasOneThrough | RelationKind::HasManyThrough => {
            let local_key = match &relation.local_key {
                Some(key) => key.clone(),
                None => single_pk(entity).ok_or_else(|| unresolved("local_key"))?,
            };
            let foreign_key = relation
                .foreign_key
                .clone()
                .ok_or_else(|| unresolved("foreign_key"))?;
            let pivot = relation.pivot.clone().ok_or_else(|| unresolved("pivot"))?;
            (local_key, foreign_key, Some(pivot))
        }
    };

    Ok(RelationDescriptor {
        name: relation.name.clone(),
        kind: relation.kind,
        related: relation.related.clone(),
        local_key,
        foreign_key,
        pivot,
    })
}

/// Look for exactly one relation on `related` that is the inverse of
/// `relation` and extract a key from it. Only explicitly declared values
/// count, so the result does not depend on declaration order.
fn infer_from_inverse<T>(
    entity: &EntityDefinition,
    relation: &RelationDefinition,
    related: &EntityDefinition,
    extract: impl Fn(&RelationDefinition) -> Option<T>,
) -> Result<Option<T>, SchemaError> {
    let candidates: Vec<&RelationDefinition> = related
        .relations
        .iter()
        .filter(|inv| inv.related == entity.name && relation.kind.inverse_kinds().contains(&inv.kind))
        .collect();

    match candidates.as_slice() {
        [] => Ok(None),
        [one] => Ok(extract(one)),
        many => Err(SchemaError::AmbiguousRelation {
            entity: entity.name.clone(),
            relation: relation.name.clone(),
            candidates: many
                .iter()
                .map(|r| format!("{}.{}", related.name, r.name))
                .collect(),
        }),
    }
}

fn single_pk(entity: &EntityDefinition) -> Option<String> {
    match entity.primary_key.as_slice() {
        [pk] => Some(pk.clone()),
        _ => None,
    }
}

/// The single-column foreign key on `entity` referencing `target`, if unique.
fn single_fk_column(entity: &EntityDefinition, target: &str) -> Option<String> {
    let mut matches = entity
        .foreign_keys
        .iter()
        .filter(|fk| fk.references.table == target && fk.columns.len() == 1);
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    first.columns.first().cloned()
}

fn default_data_type() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

fn default_primary_key() -> Vec<String> {
    vec!["id".to_string()]
}

fn default_created_at() -> String {
    "created_at".to_string()
}

fn default_updated_at() -> String {
    "updated_at".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOP: &str = r#"
entities:
  - name: orders
    columns:
      - { name: id, data_type: bigint, nullable: false }
      - { name: customer_id, data_type: bigint }
      - { name: total, data_type: numeric }
      - { name: lock_version, data_type: integer }
    foreign_keys:
      - name: orders_customer_fk
        columns: [customer_id]
        references: { table: customers, columns: [id] }
    relations:
      - { name: customer, kind: belongs_to, related: customers }
      - name: tags
        kind: belongs_to_many
        related: tags
        pivot: { table: order_tag, local_pivot_key: order_id, related_pivot_key: tag_id }
    lockable: true
  - name: customers
    columns:
      - { name: id, data_type: bigint }
      - { name: name }
      - { name: deleted_at, data_type: timestamp with time zone }
    relations:
      - { name: orders, kind: has_many, related: orders }
    soft_deletes: deleted_at
  - name: tags
    columns:
      - { name: id, data_type: bigint }
      - { name: label }
    relations:
      - { name: orders, kind: belongs_to_many, related: orders }
"#;

    fn shop() -> SchemaRegistry {
        SchemaRegistry::build(SchemaDefinition::from_yaml(SHOP).unwrap(), "default").unwrap()
    }

    #[test]
    fn test_belongs_to_keys_inferred_from_foreign_key_metadata() {
        let registry = shop();
        let orders = registry.entity("orders").unwrap();
        let customer = orders.relation("customer").unwrap();
        assert_eq!(customer.local_key, "customer_id");
        assert_eq!(customer.foreign_key, "id");
        assert_eq!(orders.connection, "default");
        assert!(orders.is_lockable());
    }

    #[test]
    fn test_has_many_foreign_key_inferred_from_related_metadata() {
        let registry = shop();
        let customers = registry.entity("customers").unwrap();
        let orders = customers.relation("orders").unwrap();
        assert_eq!(orders.local_key, "id");
        assert_eq!(orders.foreign_key, "customer_id");
        assert_eq!(customers.soft_delete_column(), Some("deleted_at"));
    }

    #[test]
    fn test_pivot_inferred_from_inverse_many_to_many() {
        let registry = shop();
        let tags = registry.entity("tags").unwrap();
        let pivot = tags.relation("orders").unwrap().pivot.clone().unwrap();
        assert_eq!(pivot.table, "order_tag");
        assert_eq!(pivot.local_pivot_key, "tag_id");
        assert_eq!(pivot.related_pivot_key, "order_id");
    }

    #[test]
    fn test_resolve_path_walks_hops() {
        let registry = shop();
        let hops = registry.resolve_path("orders", "customer.orders").unwrap();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].related.name, "customers");
        assert_eq!(hops[1].related.name, "orders");
    }

    #[test]
    fn test_resolve_path_reports_missing_segment() {
        let registry = shop();
        let err = registry.resolve_path("orders", "customer.address").unwrap_err();
        assert_eq!(err, SchemaError::relation_not_found("customers", "address"));
    }

    #[test]
    fn test_inverse_of_pairs_belongs_to_with_has_many() {
        let registry = shop();
        let inverse = registry.inverse_of("orders", "customer").unwrap().unwrap();
        assert_eq!(inverse.name, "orders");
    }

    #[test]
    fn test_has_many_foreign_key_inferred_from_inverse() {
        let yaml = r#"
entities:
  - name: users
    relations:
      - { name: posts, kind: has_many, related: posts }
  - name: posts
    relations:
      - { name: author, kind: belongs_to, related: users, local_key: author_id }
"#;
        let registry =
            SchemaRegistry::build(SchemaDefinition::from_yaml(yaml).unwrap(), "default").unwrap();
        let posts = registry.entity("users").unwrap().relation("posts").unwrap();
        assert_eq!(posts.foreign_key, "author_id");
        assert_eq!(posts.local_key, "id");
    }

    #[test]
    fn test_two_inverse_candidates_are_ambiguous() {
        let yaml = r#"
entities:
  - name: users
    relations:
      - { name: posts, kind: has_many, related: posts }
  - name: posts
    relations:
      - { name: author, kind: belongs_to, related: users, local_key: author_id }
      - { name: editor, kind: belongs_to, related: users, local_key: editor_id }
"#;
        let err = SchemaRegistry::build(SchemaDefinition::from_yaml(yaml).unwrap(), "default")
            .unwrap_err();
        assert!(matches!(err, SchemaError::AmbiguousRelation { .. }));
    }

    #[test]
    fn test_unresolvable_key_is_reported() {
        let yaml = r#"
entities:
  - name: users
    relations:
      - { name: profile, kind: has_one, related: profiles }
  - name: profiles
"#;
        let err = SchemaRegistry::build(SchemaDefinition::from_yaml(yaml).unwrap(), "default")
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnresolvedRelationKey {
                entity: "users".into(),
                relation: "profile".into(),
                key: "foreign_key",
            }
        );
    }
}
