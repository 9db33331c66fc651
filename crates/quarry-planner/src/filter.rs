//! Filter tree compilation.
//!
//! A [`FiltersGroup`] becomes a list of [`Where`] entries on a query scoped
//! to one entity. Leaves whose property still traverses a relation after the
//! scope prefix is stripped become existence predicates on the first hop,
//! with the remainder compiled inside the related sub-query.

use quarry_core::{
    Connective, EntitySchema, Filter, FilterLeaf, FiltersGroup, Operation, Operator,
    PermissionCheck, PermissionName, SchemaError, SchemaRegistry,
};

use crate::classifier::strip_entity;
use crate::query::{Predicate, Query, Where};

pub struct FilterCompiler<'a> {
    registry: &'a SchemaRegistry,
    grants: &'a dyn PermissionCheck,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(registry: &'a SchemaRegistry, grants: &'a dyn PermissionCheck) -> Self {
        Self { registry, grants }
    }

    pub fn registry(&self) -> &'a SchemaRegistry {
        self.registry
    }

    /// Compile `group` and append it to `query`.
    pub fn apply(&self, query: &mut Query, group: &FiltersGroup) -> Result<(), SchemaError> {
        let entity = self.registry.entity(&query.entity)?;
        let clauses = self.compile_group(entity, group)?;
        query.push_wheres(clauses);
        Ok(())
    }

    /// Compile the members of `group`, each joined by the group's connective.
    pub fn compile_group(
        &self,
        entity: &EntitySchema,
        group: &FiltersGroup,
    ) -> Result<Vec<Where>, SchemaError> {
        group
            .filters
            .iter()
            .map(|filter| self.compile_filter(entity, group.operator, filter))
            .collect()
    }

    fn compile_filter(
        &self,
        entity: &EntitySchema,
        boolean: Connective,
        filter: &Filter,
    ) -> Result<Where, SchemaError> {
        match filter {
            Filter::Group(group) => Ok(Where {
                boolean,
                predicate: Predicate::Group(self.compile_group(entity, group)?),
            }),
            Filter::Leaf(leaf) => self.compile_leaf(entity, boolean, leaf),
        }
    }

    fn compile_leaf(
        &self,
        entity: &EntitySchema,
        boolean: Connective,
        leaf: &FilterLeaf,
    ) -> Result<Where, SchemaError> {
        let property = strip_entity(&entity.name, &leaf.property);

        if let Some((relation, rest)) = property.split_once('.') {
            let hop = self.registry.relation(entity, relation)?;
            let mut sub = Query::new(&hop.related.name);

            if !rest.contains('.')
                && hop.related.soft_delete_column() == Some(rest)
                && self.grants.allows(&PermissionName::new(
                    &hop.related.connection,
                    &hop.related.name,
                    Operation::Delete,
                ))
            {
                sub.with_trashed = true;
            }

            let nested = FilterLeaf {
                property: rest.to_string(),
                operator: leaf.operator,
                value: leaf.value.clone(),
            };
            sub.push_where(self.compile_leaf(hop.related, Connective::And, &nested)?);

            return Ok(Where {
                boolean,
                predicate: Predicate::Exists {
                    relation: relation.to_string(),
                    query: Box::new(sub),
                },
            });
        }

        let column = property.to_string();
        let predicate = if leaf.value.is_null() {
            Predicate::Null {
                column,
                negated: leaf.operator != Operator::Equals,
            }
        } else if leaf.operator.is_pattern() {
            Predicate::Like {
                column,
                pattern: leaf.value.clone(),
                negated: leaf.operator == Operator::NotLike,
            }
        } else {
            Predicate::Compare {
                column,
                operator: leaf.operator,
                value: leaf.value.clone(),
            }
        };

        Ok(Where { boolean, predicate })
    }
}
