//! Eager-load planning.
//!
//! Collects every relation a request needs, drops blacklisted traversal
//! helpers, and builds one sub-query per relation path with its columns,
//! aggregates, filters and sorts.

use quarry_core::{
    Column, EntitySchema, FiltersGroup, PlannerConfig, RelationHop, SchemaError, SchemaRegistry,
    Sort,
};
use std::collections::BTreeMap;

use crate::classifier::{ALL_COLUMNS, Classified};
use crate::error::PlanError;
use crate::filter::FilterCompiler;
use crate::query::{Aggregate, AggregateKind, Query};
use crate::sort::normalize_select;

/// Everything the loader needs besides the main query.
pub struct RelationRequest<'r> {
    /// Relations named explicitly by the caller.
    pub explicit: &'r [String],
    pub classified: Classified,
    /// Sorts keyed by relation path.
    pub sorts: BTreeMap<String, Vec<Sort>>,
    /// Filters keyed by relation path.
    pub filters: BTreeMap<String, FiltersGroup>,
}

pub struct RelationLoader<'a> {
    registry: &'a SchemaRegistry,
    config: &'a PlannerConfig,
    compiler: &'a FilterCompiler<'a>,
}

impl<'a> RelationLoader<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        config: &'a PlannerConfig,
        compiler: &'a FilterCompiler<'a>,
    ) -> Self {
        Self {
            registry,
            config,
            compiler,
        }
    }

    /// Relation paths to eager-load, parents before children, in first-seen
    /// order. Paths crossing a blacklisted relation are dropped.
    pub fn relation_set(&self, request: &RelationRequest<'_>) -> Vec<String> {
        let mut wanted: Vec<&str> = Vec::new();
        wanted.extend(request.explicit.iter().map(String::as_str));
        wanted.extend(request.classified.relations.paths());
        wanted.extend(request.sorts.keys().map(String::as_str));
        wanted.extend(
            request
                .classified
                .aggregates
                .paths()
                .filter_map(|path| path.rsplit_once('.').map(|(parent, _)| parent)),
        );

        let mut set: Vec<String> = Vec::new();
        for path in wanted {
            if path.is_empty() {
                continue;
            }
            if let Some(segment) = path.split('.').find(|s| self.config.is_blacklisted(s)) {
                tracing::debug!(relation = path, segment, "dropping blacklisted relation");
                continue;
            }
            // parents first
            let mut end = 0;
            for segment in path.split('.') {
                end += segment.len();
                let prefix = &path[..end];
                if !set.iter().any(|p| p == prefix) {
                    set.push(prefix.to_string());
                }
                end += 1;
            }
        }
        set
    }

    /// Attach eager loads and aggregates to `query`, which is scoped to
    /// `entity`. Returns the parent-side key columns the main SELECT needs.
    pub fn load(
        &self,
        query: &mut Query,
        entity: &EntitySchema,
        mut request: RelationRequest<'_>,
    ) -> Result<Vec<String>, PlanError> {
        let set = self.relation_set(&request);

        // Aggregates over the main entity and its direct relations are
        // applied here and never reach the per-relation pass.
        if let Some(columns) = request.classified.aggregates.remove("") {
            for column in &columns {
                self.apply_root_aggregate(query, entity, column)?;
            }
        }
        let direct: Vec<String> = request
            .classified
            .aggregates
            .paths()
            .filter(|p| !p.contains('.'))
            .map(String::from)
            .collect();
        for path in direct {
            self.registry.relation(entity, &path)?;
            if let Some(columns) = request.classified.aggregates.remove(&path) {
                push_aggregates(query, &path, &columns);
            }
        }

        for path in request.classified.aggregates.paths() {
            let parent = path.rsplit_once('.').map_or(path, |(parent, _)| parent);
            if !set.iter().any(|p| p == parent) {
                tracing::debug!(path, "aggregate dropped with its relation");
            }
        }

        let mut parent_keys = Vec::new();
        for path in &set {
            let hops = self.registry.resolve_path(&entity.name, path)?;
            let Some(&hop) = hops.last() else {
                continue;
            };

            let sub = self.build(path, hop, &set, &request)?;

            let parent = match path.rsplit_once('.') {
                Some((parent_path, _)) => query
                    .eager_mut(parent_path)
                    .ok_or_else(|| SchemaError::relation_not_found(&entity.name, parent_path))?,
                None => {
                    if !parent_keys.contains(&hop.relation.local_key) {
                        parent_keys.push(hop.relation.local_key.clone());
                    }
                    &mut *query
                }
            };
            parent.with(&hop.relation.name, sub);
        }

        Ok(parent_keys)
    }

    /// Build the eager-load sub-query for one relation path.
    fn build(
        &self,
        path: &str,
        hop: RelationHop<'_>,
        set: &[String],
        request: &RelationRequest<'_>,
    ) -> Result<Query, PlanError> {
        let related = hop.related;
        let mut sub = Query::new(&related.name);

        // (1) columns plus the keys needed to stitch rows back together
        let mut columns = request.classified.relations.names(path);
        if !columns.is_empty() && !columns.iter().any(|c| c == ALL_COLUMNS) {
            columns.push(hop.relation.foreign_key.clone());
            columns.extend(related.foreign_key_columns().into_iter().map(String::from));
            for child in direct_children(path, set) {
                if let Some(descriptor) = related.relation(child) {
                    columns.push(descriptor.local_key.clone());
                }
            }
        }

        // (2) deterministic select with the primary key
        sub.select = normalize_select(related, &columns);

        // (3) aggregates one hop below this relation
        for (agg_path, aggregates) in request.classified.aggregates.iter() {
            if let Some((parent, child)) = agg_path.rsplit_once('.')
                && parent == path
            {
                self.registry.relation(related, child)?;
                push_aggregates(&mut sub, child, aggregates);
            }
        }

        // (4) relation-scoped filters
        if let Some(group) = request.filters.get(path) {
            self.compiler.apply(&mut sub, group)?;
        }

        // (5) relation-scoped sort
        if let Some(sorts) = request.sorts.get(path) {
            for sort in sorts {
                sub.order_by(&sort.property, sort.direction);
            }
        }

        Ok(sub)
    }

    fn apply_root_aggregate(
        &self,
        query: &mut Query,
        entity: &EntitySchema,
        column: &Column,
    ) -> Result<(), PlanError> {
        let Some(kind) = AggregateKind::from_column_kind(column.kind) else {
            return Ok(());
        };

        // `{name: "items", kind: COUNT}` counts a relation rather than rows
        if entity.relation(&column.name).is_some() && !kind.needs_column() {
            query
                .aggregates
                .push(Aggregate::relation(&column.name, kind, None));
            return Ok(());
        }

        if kind.needs_column() && column.name == ALL_COLUMNS {
            tracing::warn!(entity = %entity.name, %kind, "aggregate needs a column, skipping");
            return Ok(());
        }
        query
            .totals
            .push(Aggregate::total(kind, Some(column.name.clone())));
        Ok(())
    }
}

fn push_aggregates(query: &mut Query, relation: &str, columns: &[Column]) {
    for column in columns {
        let Some(kind) = AggregateKind::from_column_kind(column.kind) else {
            continue;
        };
        if kind.needs_column() && column.name == ALL_COLUMNS {
            tracing::warn!(relation, %kind, "aggregate needs a column, skipping");
            continue;
        }
        query
            .aggregates
            .push(Aggregate::relation(relation, kind, Some(column.name.clone())));
    }
}

/// Last segments of paths in `set` that sit directly below `path`.
fn direct_children<'s>(path: &str, set: &'s [String]) -> impl Iterator<Item = &'s str> {
    let prefix = format!("{path}.");
    set.iter().filter_map(move |candidate| {
        candidate
            .strip_prefix(prefix.as_str())
            .filter(|rest| !rest.contains('.'))
    })
}
