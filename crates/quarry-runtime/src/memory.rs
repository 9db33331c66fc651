//! In-memory row store.
//!
//! Backs tests and dry runs. Writes are serialized behind one mutex so the
//! version check and the write happen as a single step, the same guarantee
//! a guarded `UPDATE ... WHERE version = ?` gives on a real database.
//!
//! Only flat queries are executed: comparisons, null checks, patterns and
//! groups over the entity's own columns. Relation predicates, eager loads
//! and aggregates need a SQL adapter.

use anyhow::{Context, bail};
use async_trait::async_trait;
use quarry_core::{Connective, Direction, EntitySchema, Operator, SchemaRegistry};
use quarry_planner::{Predicate, Query, Where};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::record::Row;
use crate::store::{
    DeleteStatement, QueryExecutor, QueryResult, RowStore, UpdateStatement, VersionGuard,
};

pub struct MemoryRowStore {
    registry: Arc<SchemaRegistry>,
    tables: Mutex<HashMap<String, Vec<Row>>>,
}

impl MemoryRowStore {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a table, replacing its rows.
    pub async fn seed(&self, table: impl Into<String>, rows: Vec<Row>) {
        self.tables.lock().await.insert(table.into(), rows);
    }

    /// Snapshot of a table.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

fn matches_key(row: &Row, key: &Row) -> bool {
    key.iter().all(|(column, value)| row.get(column) == Some(value))
}

fn matches_guard(row: &Row, guard: Option<&VersionGuard>) -> bool {
    let Some(guard) = guard else {
        return true;
    };
    let current = row.get(&guard.column).filter(|v| !v.is_null());
    match (guard.expected, current) {
        (None, None) => true,
        (Some(expected), Some(value)) => value.as_i64() == Some(expected),
        _ => false,
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn insert(&self, entity: &EntitySchema, values: &Row) -> anyhow::Result<Row> {
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(entity.name.clone()).or_default();
        let mut row = values.clone();

        if let [pk] = entity.primary_key()
            && row.get(pk).is_none_or(Value::is_null)
        {
            let next = rows
                .iter()
                .filter_map(|r| r.get(pk).and_then(Value::as_i64))
                .max()
                .unwrap_or(0)
                + 1;
            row.insert(pk.clone(), Value::from(next));
        }

        let key: Row = entity
            .primary_key()
            .iter()
            .filter_map(|pk| row.get(pk).map(|v| (pk.clone(), v.clone())))
            .collect();
        if key.len() == entity.primary_key().len() && rows.iter().any(|r| matches_key(r, &key)) {
            bail!("duplicate key {} in {}", Value::Object(key), entity.name);
        }

        rows.push(row.clone());
        Ok(row)
    }

    async fn update(&self, statement: &UpdateStatement) -> anyhow::Result<u64> {
        let mut tables = self.tables.lock().await;
        let Some(rows) = tables.get_mut(&statement.table) else {
            return Ok(0);
        };

        let mut affected = 0;
        for row in rows.iter_mut().filter(|r| {
            matches_key(r, &statement.key) && matches_guard(r, statement.guard.as_ref())
        }) {
            row.extend(statement.values.clone());
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(&self, statement: &DeleteStatement) -> anyhow::Result<u64> {
        let mut tables = self.tables.lock().await;
        let Some(rows) = tables.get_mut(&statement.table) else {
            return Ok(0);
        };

        let before = rows.len();
        rows.retain(|r| {
            !(matches_key(r, &statement.key) && matches_guard(r, statement.guard.as_ref()))
        });
        Ok((before - rows.len()) as u64)
    }

    async fn find(&self, entity: &EntitySchema, key: &Row) -> anyhow::Result<Option<Row>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&entity.name)
            .and_then(|rows| rows.iter().find(|r| matches_key(r, key)))
            .cloned())
    }
}

#[async_trait]
impl QueryExecutor for MemoryRowStore {
    async fn fetch(&self, query: &Query) -> anyhow::Result<QueryResult> {
        if !query.eager.is_empty() || !query.aggregates.is_empty() || !query.totals.is_empty() {
            bail!(
                "in-memory executor cannot load relations or aggregates for {}",
                query.entity
            );
        }
        let schema = self
            .registry
            .entity(&query.entity)
            .with_context(|| format!("fetching {}", query.entity))?;

        let tables = self.tables.lock().await;
        let mut rows = Vec::new();
        for row in tables.get(&query.entity).into_iter().flatten() {
            if !query.with_trashed
                && let Some(column) = schema.soft_delete_column()
                && row.get(column).is_some_and(|v| !v.is_null())
            {
                continue;
            }
            if eval_wheres(row, &query.wheres)? {
                rows.push(row.clone());
            }
        }
        drop(tables);

        rows.sort_by(|a, b| {
            query
                .orders
                .iter()
                .map(|order| {
                    let ord = compare_nullable(a.get(&order.column), b.get(&order.column));
                    match order.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    }
                })
                .find(|ord| ord.is_ne())
                .unwrap_or(Ordering::Equal)
        });

        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        let rows = rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| project(row, &query.select))
            .collect();

        Ok(QueryResult { rows, totals: None })
    }
}

// =============================================================================
// EVALUATION
// =============================================================================

/// Evaluate a WHERE list with SQL precedence: AND binds tighter than OR.
fn eval_wheres(row: &Row, wheres: &[Where]) -> anyhow::Result<bool> {
    let mut any = false;
    let mut run = true;
    for (i, clause) in wheres.iter().enumerate() {
        if i > 0 && clause.boolean == Connective::Or {
            any |= run;
            run = true;
        }
        run = run && eval_predicate(row, &clause.predicate)?;
    }
    Ok(any || run)
}

fn eval_predicate(row: &Row, predicate: &Predicate) -> anyhow::Result<bool> {
    Ok(match predicate {
        Predicate::Compare {
            column,
            operator,
            value,
        } => compare(row.get(column).unwrap_or(&Value::Null), *operator, value),
        Predicate::Null { column, negated } => {
            row.get(column).is_none_or(Value::is_null) != *negated
        }
        Predicate::Like {
            column,
            pattern,
            negated,
        } => match (row.get(column).and_then(Value::as_str), pattern.as_str()) {
            (Some(text), Some(pattern)) => like(text, pattern) != *negated,
            _ => false,
        },
        Predicate::Group(clauses) => clauses.is_empty() || eval_wheres(row, clauses)?,
        Predicate::Exists { relation, .. } => {
            bail!("in-memory executor cannot evaluate relation predicate on '{relation}'")
        }
    })
}

fn compare(actual: &Value, operator: Operator, expected: &Value) -> bool {
    if actual.is_null() {
        return false;
    }
    let ordering = || compare_values(actual, expected);
    match operator {
        Operator::Equals => ordering() == Some(Ordering::Equal),
        Operator::NotEquals => ordering().is_some_and(Ordering::is_ne),
        Operator::LessThan => ordering() == Some(Ordering::Less),
        Operator::LessThanOrEqual => ordering().is_some_and(Ordering::is_le),
        Operator::GreaterThan => ordering() == Some(Ordering::Greater),
        Operator::GreaterThanOrEqual => ordering().is_some_and(Ordering::is_ge),
        Operator::In | Operator::NotIn => {
            let found = match expected {
                Value::Array(items) => items
                    .iter()
                    .any(|item| compare_values(actual, item) == Some(Ordering::Equal)),
                other => compare_values(actual, other) == Some(Ordering::Equal),
            };
            found == (operator == Operator::In)
        }
        Operator::Like | Operator::NotLike => match (actual.as_str(), expected.as_str()) {
            (Some(text), Some(pattern)) => like(text, pattern) == (operator == Operator::Like),
            _ => false,
        },
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        // Loose comparison for keys passed as strings.
        (Value::Number(x), Value::String(y)) => x.as_f64()?.partial_cmp(&y.parse().ok()?),
        (Value::String(x), Value::Number(y)) => x.parse::<f64>().ok()?.partial_cmp(&y.as_f64()?),
        _ => None,
    }
}

/// NULLs sort last, as in PostgreSQL's default ascending order.
fn compare_nullable(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

/// SQL LIKE with `%` and `_` wildcards.
fn like(text: &str, pattern: &str) -> bool {
    fn go(text: &[char], pattern: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('%', rest)) => (0..=text.len()).any(|i| go(&text[i..], rest)),
            Some(('_', rest)) => !text.is_empty() && go(&text[1..], rest),
            Some((c, rest)) => text.first() == Some(c) && go(&text[1..], rest),
        }
    }
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    go(&text, &pattern)
}

fn project(row: Row, select: &[String]) -> Row {
    if select.is_empty() {
        return row;
    }
    row.into_iter()
        .filter(|(column, _)| select.contains(column))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quarry_core::SchemaDefinition;
    use serde_json::json;

    const SCHEMA: &str = r#"
entities:
  - name: notes
    columns:
      - { name: id, data_type: bigint }
      - { name: title, data_type: text }
      - { name: priority, data_type: integer }
      - { name: deleted_at, data_type: timestamptz }
    primary_key: [id]
    soft_deletes: deleted_at
"#;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn store() -> MemoryRowStore {
        let def = SchemaDefinition::from_yaml(SCHEMA).unwrap();
        let registry = SchemaRegistry::build(def, "default").unwrap();
        MemoryRowStore::new(Arc::new(registry))
    }

    async fn seeded() -> MemoryRowStore {
        let store = store();
        store
            .seed(
                "notes",
                vec![
                    row(json!({ "id": 1, "title": "alpha", "priority": 3, "deleted_at": null })),
                    row(json!({ "id": 2, "title": "beta", "priority": 1, "deleted_at": null })),
                    row(json!({ "id": 3, "title": "gamma", "priority": 2, "deleted_at": "2024-01-01" })),
                    row(json!({ "id": 4, "title": "alphabet", "priority": null, "deleted_at": null })),
                ],
            )
            .await;
        store
    }

    fn ids(result: &QueryResult) -> Vec<i64> {
        result
            .rows
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_i64))
            .collect()
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like("alphabet", "alpha%"));
        assert!(like("beta", "_eta"));
        assert!(!like("beta", "_eta_"));
        assert!(like("", "%"));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let r = row(json!({ "a": 1, "b": 2, "c": 3 }));
        let eq = |column: &str, value: i64| Predicate::Compare {
            column: column.into(),
            operator: Operator::Equals,
            value: json!(value),
        };
        // a = 9 OR b = 2 AND c = 3
        let wheres = vec![
            Where::and(eq("a", 9)),
            Where::or(eq("b", 2)),
            Where::and(eq("c", 3)),
        ];
        assert!(eval_wheres(&r, &wheres).unwrap());

        // a = 9 AND b = 2 OR c = 4
        let wheres = vec![
            Where::and(eq("a", 9)),
            Where::and(eq("b", 2)),
            Where::or(eq("c", 4)),
        ];
        assert!(!eval_wheres(&r, &wheres).unwrap());
    }

    #[tokio::test]
    async fn test_fetch_excludes_soft_deleted_and_orders() {
        let store = seeded().await;
        let mut query = Query::new("notes");
        query.order_by("priority", Direction::Asc);

        let result = store.fetch(&query).await.unwrap();
        assert_eq!(ids(&result), vec![2, 1, 4]);

        query.with_trashed = true;
        let result = store.fetch(&query).await.unwrap();
        assert_eq!(ids(&result), vec![2, 3, 1, 4]);
    }

    #[tokio::test]
    async fn test_fetch_filters_projects_and_pages() {
        let store = seeded().await;
        let mut query = Query::new("notes");
        query.select = vec!["id".into(), "title".into()];
        query.push_where(Where::and(Predicate::Like {
            column: "title".into(),
            pattern: json!("alpha%"),
            negated: false,
        }));
        query.order_by("id", Direction::Desc);
        query.limit = Some(1);

        let result = store.fetch(&query).await.unwrap();
        assert_eq!(result.rows, vec![row(json!({ "id": 4, "title": "alphabet" }))]);
    }

    #[tokio::test]
    async fn test_fetch_rejects_relation_predicates() {
        let store = seeded().await;
        let mut query = Query::new("notes");
        query.push_where(Where::and(Predicate::Exists {
            relation: "tags".into(),
            query: Box::new(Query::new("tags")),
        }));
        assert!(store.fetch(&query).await.is_err());
    }

    #[tokio::test]
    async fn test_guarded_update_checks_version() {
        let store = store();
        store
            .seed("notes", vec![row(json!({ "id": 1, "lock_version": 2 }))])
            .await;

        let mut statement = UpdateStatement {
            table: "notes".into(),
            key: row(json!({ "id": 1 })),
            values: row(json!({ "lock_version": 3 })),
            guard: Some(VersionGuard {
                column: "lock_version".into(),
                expected: Some(1),
            }),
        };
        assert_eq!(store.update(&statement).await.unwrap(), 0);

        statement.guard = Some(VersionGuard {
            column: "lock_version".into(),
            expected: Some(2),
        });
        assert_eq!(store.update(&statement).await.unwrap(), 1);
        assert_eq!(store.rows("notes").await[0]["lock_version"], json!(3));
    }

    #[tokio::test]
    async fn test_insert_generates_id() {
        let store = seeded().await;
        let schema = store.registry.entity("notes").unwrap().clone();
        let stored = store
            .insert(&schema, &row(json!({ "title": "delta" })))
            .await
            .unwrap();
        assert_eq!(stored["id"], json!(5));

        let duplicate = store.insert(&schema, &row(json!({ "id": 5 }))).await;
        assert!(duplicate.is_err());
    }
}
