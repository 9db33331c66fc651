//! # quarry-planner
//!
//! Turns a validated [`QueryRequest`] into a backend-neutral [`Query`]:
//!
//! 1. [`classifier`] splits requested columns into main, relation and
//!    aggregate buckets.
//! 2. [`filter`] compiles boolean filter trees, including filters that
//!    traverse relations.
//! 3. [`relations`] builds one eager load per relation path.
//! 4. [`sort`] produces deterministic SELECT lists that always carry the
//!    primary key.
//!
//! Planning is pure: no I/O, no shared mutable state.

pub mod classifier;
pub mod error;
pub mod filter;
pub mod query;
pub mod relations;
pub mod sort;

use quarry_core::{
    EntitySchema, FiltersGroup, Operation, Operator, PermissionCheck, PermissionName,
    PlannerConfig, QueryRequest, SchemaRegistry, Sort,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use classifier::{Buckets, Classified, classify};
pub use error::PlanError;
pub use filter::FilterCompiler;
pub use query::{Aggregate, AggregateKind, EagerLoad, Order, Predicate, Query, Where};
pub use relations::{RelationLoader, RelationRequest};
pub use sort::normalize_select;

use classifier::{ALL_COLUMNS, strip_entity};

/// Plans read queries against a schema registry.
#[derive(Debug, Clone)]
pub struct Planner {
    registry: Arc<SchemaRegistry>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(registry: Arc<SchemaRegistry>, config: PlannerConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan a list query.
    ///
    /// `grants` answers permission checks that influence planning, such as
    /// whether soft-deleted rows may be included.
    pub fn plan(
        &self,
        entity: &str,
        request: &QueryRequest,
        grants: &dyn PermissionCheck,
    ) -> Result<Query, PlanError> {
        let schema = self.registry.entity(entity)?;
        let compiler = FilterCompiler::new(&self.registry, grants);
        let loader = RelationLoader::new(&self.registry, &self.config, &compiler);

        let classified = classify(entity, &request.columns());
        let mut columns: Vec<String> = classified.main.iter().map(|c| c.name.clone()).collect();

        let mut query = Query::new(entity);

        let (main_sorts, relation_sorts) = split_sorts(entity, &request.sort);
        for sort in main_sorts {
            query.order_by(sort.property, sort.direction);
        }

        if let Some(filters) = request.filters() {
            compiler.apply(&mut query, &filters)?;
        }

        let relation_filters: BTreeMap<String, FiltersGroup> = request
            .relation_filters
            .iter()
            .map(|(path, input)| (path.clone(), FiltersGroup::from(input.clone())))
            .collect();

        let parent_keys = loader.load(
            &mut query,
            schema,
            RelationRequest {
                explicit: &request.relations,
                classified,
                sorts: relation_sorts,
                filters: relation_filters,
            },
        )?;

        if !columns.is_empty() && !columns.iter().any(|c| c == ALL_COLUMNS) {
            columns.extend(parent_keys);
        }
        query.select = normalize_select(schema, &columns);

        query.with_trashed = request.with_trashed
            && grants.allows(&PermissionName::new(
                &schema.connection,
                &schema.name,
                Operation::Delete,
            ));
        let max = self.config.max_limit;
        query.limit = Some(request.limit.map_or(max, |limit| limit.min(max)));
        query.offset = request.offset;

        tracing::debug!(
            entity,
            eager = ?query.eager_paths(),
            aggregates = query.aggregates.len(),
            "planned query"
        );
        Ok(query)
    }

    /// Plan a single-record lookup by primary key.
    pub fn plan_detail(
        &self,
        entity: &str,
        key: &Value,
        request: &QueryRequest,
        grants: &dyn PermissionCheck,
    ) -> Result<Query, PlanError> {
        let schema = self.registry.entity(entity)?;
        let mut query = self.plan(entity, request, grants)?;
        query.push_wheres(key_predicates(schema, key)?);
        query.totals.clear();
        query.limit = Some(1);
        query.offset = None;
        Ok(query)
    }
}

/// Equality predicates matching `key` against the primary key of `entity`.
///
/// A scalar matches a single-column key; an object supplies each key column
/// by name.
pub fn key_predicates(entity: &EntitySchema, key: &Value) -> Result<Vec<Where>, PlanError> {
    let invalid = |reason: String| PlanError::InvalidKey {
        entity: entity.name.clone(),
        reason,
    };

    let pairs: Vec<(String, Value)> = match (entity.primary_key(), key) {
        (_, Value::Object(map)) => entity
            .primary_key()
            .iter()
            .map(|pk| {
                map.get(pk)
                    .filter(|v| !v.is_null())
                    .map(|v| (pk.clone(), v.clone()))
                    .ok_or_else(|| invalid(format!("missing key column '{pk}'")))
            })
            .collect::<Result<_, _>>()?,
        ([pk], Value::Null | Value::Array(_)) => {
            return Err(invalid(format!("'{pk}' needs a scalar value")));
        }
        ([pk], scalar) => vec![(pk.clone(), scalar.clone())],
        (pks, _) => {
            return Err(invalid(format!(
                "composite key ({}) needs an object",
                pks.join(", ")
            )));
        }
    };

    Ok(pairs
        .into_iter()
        .map(|(column, value)| {
            Where::and(Predicate::Compare {
                column,
                operator: Operator::Equals,
                value,
            })
        })
        .collect())
}

/// Split sorts into main-entity sorts and relation-scoped sorts keyed by path.
fn split_sorts(entity: &str, sorts: &[Sort]) -> (Vec<Sort>, BTreeMap<String, Vec<Sort>>) {
    let mut main = Vec::new();
    let mut relations: BTreeMap<String, Vec<Sort>> = BTreeMap::new();
    for sort in sorts {
        let property = strip_entity(entity, &sort.property);
        match property.rsplit_once('.') {
            Some((path, column)) => relations.entry(path.to_string()).or_default().push(Sort {
                property: column.to_string(),
                direction: sort.direction,
            }),
            None => main.push(Sort {
                property: property.to_string(),
                direction: sort.direction,
            }),
        }
    }
    (main, relations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quarry_core::{AllowAll, DenyAll, Direction, SchemaDefinition};
    use serde_json::json;

    const SHOP: &str = r#"
entities:
  - name: orders
    soft_deletes: deleted_at
    foreign_keys:
      - name: orders_customer_fk
        columns: [customer_id]
        references: { table: customers, columns: [id] }
    relations:
      - { name: customer, kind: belongs_to, related: customers }
      - { name: items, kind: has_many, related: order_items }
      - { name: ancestors, kind: has_many, related: orders, foreign_key: parent_id }
  - name: order_items
    foreign_keys:
      - name: items_order_fk
        columns: [order_id]
        references: { table: orders, columns: [id] }
  - name: customers
    foreign_keys:
      - name: customers_address_fk
        columns: [address_id]
        references: { table: addresses, columns: [id] }
    relations:
      - { name: address, kind: belongs_to, related: addresses }
      - { name: orders, kind: has_many, related: orders }
  - name: addresses
    primary_key: [id]
"#;

    fn planner() -> Planner {
        let def = SchemaDefinition::from_yaml(SHOP).unwrap();
        let registry = SchemaRegistry::build(def, "shop").unwrap();
        Planner::new(Arc::new(registry), PlannerConfig::default())
    }

    fn request(value: serde_json::Value) -> QueryRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_primary_key_always_selected() {
        let query = planner()
            .plan("orders", &request(json!({ "columns": ["total", "status"] })), &DenyAll)
            .unwrap();
        assert_eq!(query.select, vec!["id", "status", "total"]);
    }

    #[test]
    fn test_relation_columns_pull_keys_on_both_sides() {
        let query = planner()
            .plan(
                "orders",
                &request(json!({ "columns": ["orders.total", "customer.name"] })),
                &DenyAll,
            )
            .unwrap();

        // parent side: the belongs_to local key
        assert_eq!(query.select, vec!["id", "customer_id", "total"]);
        // related side: owner key plus its own foreign keys
        let customer = query.eager("customer").unwrap();
        assert_eq!(customer.entity, "customers");
        assert_eq!(customer.select, vec!["address_id", "id", "name"]);
    }

    #[test]
    fn test_blacklisted_relation_never_eager_loaded() {
        let query = planner()
            .plan(
                "orders",
                &request(json!({
                    "relations": ["ancestors", "customer"],
                    "columns": ["ancestors.total"],
                    "sort": [{ "property": "ancestors.total", "direction": "desc" }]
                })),
                &DenyAll,
            )
            .unwrap();
        assert_eq!(query.eager_paths(), vec!["customer"]);
    }

    #[test]
    fn test_nested_relation_paths_load_parents_first() {
        let query = planner()
            .plan(
                "orders",
                &request(json!({
                    "columns": ["customer.address.city"],
                    "sort": [{ "property": "customer.address.city", "direction": "desc" }]
                })),
                &DenyAll,
            )
            .unwrap();

        assert_eq!(query.eager_paths(), vec!["customer", "customer.address"]);
        let customer = query.eager("customer").unwrap();
        // every column requested for customers itself: nothing constrains it
        assert!(customer.select.is_empty());

        let address = query.eager("customer.address").unwrap();
        assert_eq!(address.select, vec!["city", "id"]);
        assert_eq!(
            address.orders,
            vec![Order {
                column: "city".into(),
                direction: Direction::Desc
            }]
        );
    }

    #[test]
    fn test_aggregates_route_by_depth() {
        let query = planner()
            .plan(
                "orders",
                &request(json!({
                    "columns": [
                        { "name": "items.price", "kind": "SUM" },
                        { "name": "customer.orders.count", "kind": "COUNT" },
                        { "name": "total", "kind": "AVG" },
                        { "name": "items", "kind": "COUNT" }
                    ]
                })),
                &DenyAll,
            )
            .unwrap();

        let aliases: Vec<&str> = query.aggregates.iter().map(|a| a.alias.as_str()).collect();
        assert_eq!(aliases, vec!["items_count", "items_sum_price"]);
        assert_eq!(query.totals, vec![Aggregate::total(AggregateKind::Avg, Some("total".into()))]);

        // deferred into the customer sub-query
        let customer = query.eager("customer").unwrap();
        assert_eq!(customer.aggregates[0].alias, "orders_count");
        assert!(query.eager("items").is_none());
    }

    #[test]
    fn test_relation_filters_apply_to_sub_query() {
        let query = planner()
            .plan(
                "orders",
                &request(json!({
                    "relations": ["items"],
                    "relation_filters": {
                        "items": [{ "property": "qty", "operator": ">", "value": 1 }]
                    }
                })),
                &DenyAll,
            )
            .unwrap();

        let items = query.eager("items").unwrap();
        assert_eq!(
            items.wheres,
            vec![Where::and(Predicate::Compare {
                column: "qty".into(),
                operator: Operator::GreaterThan,
                value: json!(1),
            })]
        );
    }

    #[test]
    fn test_limit_is_clamped() {
        let planner = planner();
        let max = planner.config().max_limit;
        let query = planner
            .plan("orders", &request(json!({ "limit": max + 50, "offset": 20 })), &DenyAll)
            .unwrap();
        assert_eq!(query.limit, Some(max));
        assert_eq!(query.offset, Some(20));
    }

    #[test]
    fn test_with_trashed_requires_delete_permission() {
        let planner = planner();
        let req = request(json!({ "with_trashed": true }));
        assert!(!planner.plan("orders", &req, &DenyAll).unwrap().with_trashed);
        assert!(planner.plan("orders", &req, &AllowAll).unwrap().with_trashed);
    }

    #[test]
    fn test_unknown_relation_in_columns_fails() {
        let err = planner()
            .plan("orders", &request(json!({ "columns": ["supplier.name"] })), &DenyAll)
            .unwrap_err();
        assert_eq!(
            err,
            PlanError::Schema(quarry_core::SchemaError::relation_not_found("orders", "supplier"))
        );
    }

    #[test]
    fn test_plan_detail_matches_primary_key() {
        let query = planner()
            .plan_detail(
                "orders",
                &json!(42),
                &request(json!({ "filters": [{ "property": "status", "operator": "=", "value": "paid" }] })),
                &DenyAll,
            )
            .unwrap();

        assert_eq!(query.limit, Some(1));
        assert_eq!(query.wheres.len(), 2);
        assert_eq!(
            query.wheres[1].predicate,
            Predicate::Group(vec![Where::and(Predicate::Compare {
                column: "id".into(),
                operator: Operator::Equals,
                value: json!(42),
            })])
        );
    }

    #[test]
    fn test_plan_detail_keeps_or_filters_apart_from_key() {
        let query = planner()
            .plan_detail(
                "orders",
                &json!(42),
                &request(json!({
                    "filters": {
                        "operator": "OR",
                        "filters": [
                            { "property": "status", "operator": "=", "value": "paid" },
                            { "property": "status", "operator": "=", "value": "open" }
                        ]
                    }
                })),
                &DenyAll,
            )
            .unwrap();

        let status = |value: &str| Predicate::Compare {
            column: "status".into(),
            operator: Operator::Equals,
            value: json!(value),
        };
        // (status = paid OR status = open) AND (id = 42)
        assert_eq!(
            query.wheres,
            vec![
                Where::and(Predicate::Group(vec![
                    Where::and(status("paid")),
                    Where::or(status("open")),
                ])),
                Where::and(Predicate::Group(vec![Where::and(Predicate::Compare {
                    column: "id".into(),
                    operator: Operator::Equals,
                    value: json!(42),
                })])),
            ]
        );
    }

    #[test]
    fn test_key_predicates_reject_mismatched_keys() {
        let planner = planner();
        let orders = planner.registry().entity("orders").unwrap();
        assert!(key_predicates(orders, &json!({ "id": 7 })).is_ok());
        assert!(matches!(
            key_predicates(orders, &json!({ "uuid": 7 })),
            Err(PlanError::InvalidKey { .. })
        ));
        assert!(matches!(
            key_predicates(orders, &Value::Null),
            Err(PlanError::InvalidKey { .. })
        ));
    }
}
