//! PostgreSQL rendering of the query AST.
//!
//! Each query scope gets its own table alias (`t0`, `t1`, ...) so relation
//! sub-selects can correlate with their parent. Rows come back as one
//! `jsonb` column named `row`. Values are always bound as parameters;
//! identifiers are validated and quoted.

use anyhow::{Context, anyhow, bail};
use quarry_core::{EntitySchema, Operator, RelationHop, SchemaRegistry};
use quarry_planner::{Aggregate, AggregateKind, EagerLoad, Predicate, Query, Where};
use quarry_runtime::{DeleteStatement, Row, UpdateStatement, VersionGuard};
use serde_json::Value;

/// Key under which eager-load rows report the parent they belong to.
pub const PARENT_KEY: &str = "__parent_key";

/// A bound value and the declared type of the column it is compared with.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub value: Value,
    pub data_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

pub fn quote_ident(ident: &str) -> anyhow::Result<String> {
    if ident.is_empty() {
        bail!("empty identifier");
    }
    // Only schema-declared names reach here.
    if !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("invalid identifier '{ident}'");
    }
    Ok(format!("\"{ident}\""))
}

/// Quote a table name, honouring a `schema.table` qualifier.
pub fn quote_table(name: &str) -> anyhow::Result<String> {
    name.split('.')
        .map(quote_ident)
        .collect::<anyhow::Result<Vec<_>>>()
        .map(|parts| parts.join("."))
}

/// A validated identifier as a SQL string literal, for `jsonb_build_object` keys.
fn key_literal(name: &str) -> anyhow::Result<String> {
    quote_ident(name)?;
    Ok(format!("'{name}'"))
}

pub(crate) fn cast_for_pg_type(data_type: &str) -> Option<&'static str> {
    match data_type {
        "numeric" | "real" | "double precision" | "decimal" => Some("numeric"),
        "date" => Some("date"),
        "timestamp with time zone" | "timestamptz" => Some("timestamptz"),
        "timestamp without time zone" | "timestamp" => Some("timestamp"),
        _ => None,
    }
}

pub struct SqlRenderer<'a> {
    registry: &'a SchemaRegistry,
    params: Vec<Param>,
    aliases: usize,
}

impl<'a> SqlRenderer<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry,
            params: Vec::new(),
            aliases: 0,
        }
    }

    // =========================================================================
    // ENTRY POINTS
    // =========================================================================

    /// `SELECT <row> FROM entity AS t0 WHERE ... ORDER BY ... LIMIT ... OFFSET ...`
    pub fn select(mut self, query: &Query) -> anyhow::Result<Statement> {
        let registry = self.registry;
        let entity = registry.entity(&query.entity)?;
        let alias = self.next_alias();
        let row = self.row_expr(entity, &alias, query, None)?;
        let from = format!("{} AS {alias}", quote_table(&entity.name)?);
        let conditions = self.scope_conditions(entity, &alias, query)?;
        let sql = self.finish(format!("SELECT {row} AS row FROM {from}"), conditions, &alias, query)?;
        Ok(self.statement(sql))
    }

    /// Scalar aggregates over the filtered set, ignoring order and paging.
    pub fn totals(mut self, query: &Query) -> anyhow::Result<Option<Statement>> {
        if query.totals.is_empty() {
            return Ok(None);
        }
        let registry = self.registry;
        let entity = registry.entity(&query.entity)?;
        let alias = self.next_alias();

        let mut pairs = Vec::with_capacity(query.totals.len());
        for total in &query.totals {
            let expr = match (total.kind, &total.column) {
                (AggregateKind::Exists, _) => "COUNT(*) > 0".to_string(),
                (AggregateKind::Count, _) => "COUNT(*)".to_string(),
                (kind, Some(column)) => {
                    format!("{}({alias}.{})", kind.sql_function(), quote_ident(column)?)
                }
                (kind, None) => bail!("{kind} total on {} needs a column", entity.name),
            };
            pairs.push(format!("{}, {expr}", key_literal(&total.alias)?));
        }

        let mut sql = format!(
            "SELECT jsonb_build_object({}) AS row FROM {} AS {alias}",
            pairs.join(", "),
            quote_table(&entity.name)?
        );
        let conditions = self.scope_conditions(entity, &alias, query)?;
        if !conditions.is_empty() {
            sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
        }
        Ok(Some(self.statement(sql)))
    }

    /// Rows of one eager load for a batch of parent key values. Each row
    /// carries [`PARENT_KEY`] for stitching.
    pub fn eager(
        mut self,
        parent: &EntitySchema,
        load: &EagerLoad,
        parent_keys: &[Value],
    ) -> anyhow::Result<Statement> {
        let registry = self.registry;
        let hop = registry.relation(parent, &load.relation)?;
        let related = hop.related;
        let alias = self.next_alias();

        let (from, key_expr) = match &hop.relation.pivot {
            Some(pivot) => {
                let pivot_alias = self.next_alias();
                let from = format!(
                    "{} AS {alias} INNER JOIN {} AS {pivot_alias} ON {pivot_alias}.{} = {alias}.{}",
                    quote_table(&related.name)?,
                    quote_table(&pivot.table)?,
                    quote_ident(&pivot.related_pivot_key)?,
                    quote_ident(&hop.relation.foreign_key)?,
                );
                (from, format!("{pivot_alias}.{}", quote_ident(&pivot.local_pivot_key)?))
            }
            None => (
                format!("{} AS {alias}", quote_table(&related.name)?),
                format!("{alias}.{}", quote_ident(&hop.relation.foreign_key)?),
            ),
        };

        let key_type = parent
            .column(&hop.relation.local_key)
            .map(|c| c.data_type.clone());
        let mut conditions = vec![self.in_list(&key_expr, parent_keys, key_type, false)];
        conditions.extend(self.scope_conditions(related, &alias, &load.query)?);

        let row = self.row_expr(related, &alias, &load.query, Some(key_expr))?;
        let sql = self.finish(
            format!("SELECT {row} AS row FROM {from}"),
            conditions,
            &alias,
            &load.query,
        )?;
        Ok(self.statement(sql))
    }

    // =========================================================================
    // SCOPES
    // =========================================================================

    fn next_alias(&mut self) -> String {
        let alias = format!("t{}", self.aliases);
        self.aliases += 1;
        alias
    }

    fn statement(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }

    fn bind(&mut self, value: Value, data_type: Option<String>) -> String {
        let cast = data_type
            .as_deref()
            .and_then(cast_for_pg_type)
            .map(|c| format!("::{c}"))
            .unwrap_or_default();
        self.params.push(Param { value, data_type });
        format!("${}{cast}", self.params.len())
    }

    /// WHERE terms of one scope: its predicates and soft-delete exclusion.
    fn scope_conditions(
        &mut self,
        entity: &EntitySchema,
        alias: &str,
        query: &Query,
    ) -> anyhow::Result<Vec<String>> {
        let mut conditions = Vec::new();
        if !query.wheres.is_empty() {
            conditions.push(format!("({})", self.wheres(entity, alias, &query.wheres)?));
        }
        if !query.with_trashed
            && let Some(column) = entity.soft_delete_column()
        {
            conditions.push(format!("{alias}.{} IS NULL", quote_ident(column)?));
        }
        Ok(conditions)
    }

    fn finish(
        &mut self,
        mut sql: String,
        conditions: Vec<String>,
        alias: &str,
        query: &Query,
    ) -> anyhow::Result<String> {
        if !conditions.is_empty() {
            sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
        }
        if !query.orders.is_empty() {
            let orders = query
                .orders
                .iter()
                .map(|o| Ok(format!("{alias}.{} {}", quote_ident(&o.column)?, o.direction.as_sql())))
                .collect::<anyhow::Result<Vec<_>>>()?;
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }
        if let Some(limit) = query.limit {
            let p = self.bind(Value::from(limit), Some("bigint".into()));
            sql.push_str(&format!(" LIMIT {p}"));
        }
        if let Some(offset) = query.offset {
            let p = self.bind(Value::from(offset), Some("bigint".into()));
            sql.push_str(&format!(" OFFSET {p}"));
        }
        Ok(sql)
    }

    /// The `row` expression: selected columns plus per-row aggregates.
    fn row_expr(
        &mut self,
        entity: &EntitySchema,
        alias: &str,
        query: &Query,
        parent_key: Option<String>,
    ) -> anyhow::Result<String> {
        let base = if query.select.is_empty() {
            format!("to_jsonb({alias})")
        } else {
            let pairs = query
                .select
                .iter()
                .map(|c| Ok(format!("{}, {alias}.{}", key_literal(c)?, quote_ident(c)?)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            format!("jsonb_build_object({})", pairs.join(", "))
        };

        let mut extra = Vec::new();
        for aggregate in &query.aggregates {
            let expr = self.aggregate(entity, alias, aggregate)?;
            extra.push(format!("{}, {expr}", key_literal(&aggregate.alias)?));
        }
        if let Some(key) = parent_key {
            extra.push(format!("'{PARENT_KEY}', {key}"));
        }

        Ok(if extra.is_empty() {
            base
        } else {
            format!("{base} || jsonb_build_object({})", extra.join(", "))
        })
    }

    // =========================================================================
    // PREDICATES
    // =========================================================================

    fn wheres(&mut self, entity: &EntitySchema, alias: &str, wheres: &[Where]) -> anyhow::Result<String> {
        let mut sql = String::new();
        for (i, clause) in wheres.iter().enumerate() {
            if i > 0 {
                sql.push_str(&format!(" {} ", clause.boolean));
            }
            sql.push_str(&self.predicate(entity, alias, &clause.predicate)?);
        }
        Ok(sql)
    }

    fn predicate(&mut self, entity: &EntitySchema, alias: &str, predicate: &Predicate) -> anyhow::Result<String> {
        let column_type = |column: &str| entity.column(column).map(|c| c.data_type.clone());
        Ok(match predicate {
            Predicate::Compare {
                column,
                operator,
                value,
            } => {
                let target = format!("{alias}.{}", quote_ident(column)?);
                match operator {
                    Operator::In | Operator::NotIn => {
                        let values = match value {
                            Value::Array(items) => items.clone(),
                            other => vec![other.clone()],
                        };
                        self.in_list(&target, &values, column_type(column), *operator == Operator::NotIn)
                    }
                    op => {
                        let p = self.bind(value.clone(), column_type(column));
                        format!("{target} {} {p}", op.symbol())
                    }
                }
            }
            Predicate::Null { column, negated } => format!(
                "{alias}.{} IS {}NULL",
                quote_ident(column)?,
                if *negated { "NOT " } else { "" }
            ),
            Predicate::Like {
                column,
                pattern,
                negated,
            } => {
                let p = self.bind(pattern.clone(), Some("text".into()));
                format!(
                    "{alias}.{} {}LIKE {p}",
                    quote_ident(column)?,
                    if *negated { "NOT " } else { "" }
                )
            }
            Predicate::Group(clauses) if clauses.is_empty() => "TRUE".to_string(),
            Predicate::Group(clauses) => format!("({})", self.wheres(entity, alias, clauses)?),
            Predicate::Exists { relation, query } => {
                let registry = self.registry;
                let hop = registry.relation(entity, relation)?;
                let (from, correlation, inner_alias) = self.relation_source(&hop, alias)?;
                let mut conditions = vec![correlation];
                conditions.extend(self.scope_conditions(hop.related, &inner_alias, query)?);
                format!(
                    "EXISTS (SELECT 1 FROM {from} WHERE {})",
                    conditions.join(" AND ")
                )
            }
        })
    }

    /// `target IN ($1, $2)`; an empty list is `FALSE` (or `TRUE` when negated).
    fn in_list(&mut self, target: &str, values: &[Value], data_type: Option<String>, negated: bool) -> String {
        if values.is_empty() {
            return if negated { "TRUE" } else { "FALSE" }.to_string();
        }
        let params: Vec<String> = values
            .iter()
            .map(|v| self.bind(v.clone(), data_type.clone()))
            .collect();
        format!(
            "{target} {}IN ({})",
            if negated { "NOT " } else { "" },
            params.join(", ")
        )
    }

    /// FROM clause and correlation for a relation hop below `parent_alias`.
    fn relation_source(
        &mut self,
        hop: &RelationHop<'_>,
        parent_alias: &str,
    ) -> anyhow::Result<(String, String, String)> {
        let alias = self.next_alias();
        let relation = hop.relation;
        let local = format!("{parent_alias}.{}", quote_ident(&relation.local_key)?);

        match &relation.pivot {
            Some(pivot) => {
                let pivot_alias = self.next_alias();
                let from = format!(
                    "{} AS {alias} INNER JOIN {} AS {pivot_alias} ON {pivot_alias}.{} = {alias}.{}",
                    quote_table(&hop.related.name)?,
                    quote_table(&pivot.table)?,
                    quote_ident(&pivot.related_pivot_key)?,
                    quote_ident(&relation.foreign_key)?,
                );
                let correlation = format!(
                    "{pivot_alias}.{} = {local}",
                    quote_ident(&pivot.local_pivot_key)?
                );
                Ok((from, correlation, alias))
            }
            None => {
                let from = format!("{} AS {alias}", quote_table(&hop.related.name)?);
                let correlation =
                    format!("{alias}.{} = {local}", quote_ident(&relation.foreign_key)?);
                Ok((from, correlation, alias))
            }
        }
    }

    fn aggregate(&mut self, entity: &EntitySchema, alias: &str, aggregate: &Aggregate) -> anyhow::Result<String> {
        let relation = aggregate
            .relation
            .as_deref()
            .ok_or_else(|| anyhow!("aggregate '{}' has no relation", aggregate.alias))?;
        let registry = self.registry;
        let hop = registry
            .relation(entity, relation)
            .with_context(|| format!("aggregate '{}'", aggregate.alias))?;
        let (from, correlation, inner_alias) = self.relation_source(&hop, alias)?;

        let mut conditions = vec![correlation];
        if let Some(column) = hop.related.soft_delete_column() {
            conditions.push(format!("{inner_alias}.{} IS NULL", quote_ident(column)?));
        }
        let filter = conditions.join(" AND ");

        Ok(match (aggregate.kind, &aggregate.column) {
            (AggregateKind::Exists, _) => format!("EXISTS (SELECT 1 FROM {from} WHERE {filter})"),
            (AggregateKind::Count, _) => format!("(SELECT COUNT(*) FROM {from} WHERE {filter})"),
            (kind, Some(column)) => format!(
                "(SELECT {}({inner_alias}.{}) FROM {from} WHERE {filter})",
                kind.sql_function(),
                quote_ident(column)?
            ),
            (kind, None) => bail!("{kind} aggregate '{}' needs a column", aggregate.alias),
        })
    }
}

// =============================================================================
// WRITES
// =============================================================================

fn key_conditions(
    entity: Option<&EntitySchema>,
    key: &Row,
    params: &mut Vec<Param>,
) -> anyhow::Result<Vec<String>> {
    if key.is_empty() {
        bail!("refusing to write without a key");
    }
    key.iter()
        .map(|(column, value)| {
            params.push(param_for(entity, column, value.clone()));
            Ok(format!("{} = {}", quote_ident(column)?, placeholder(params)))
        })
        .collect()
}

fn guard_condition(
    guard: Option<&VersionGuard>,
    params: &mut Vec<Param>,
) -> anyhow::Result<Option<String>> {
    let Some(guard) = guard else {
        return Ok(None);
    };
    let column = quote_ident(&guard.column)?;
    Ok(Some(match guard.expected {
        Some(version) => {
            params.push(Param {
                value: Value::from(version),
                data_type: Some("bigint".into()),
            });
            format!("{column} = {}", placeholder(params))
        }
        None => format!("{column} IS NULL"),
    }))
}

fn param_for(entity: Option<&EntitySchema>, column: &str, value: Value) -> Param {
    Param {
        value,
        data_type: entity
            .and_then(|e| e.column(column))
            .map(|c| c.data_type.clone()),
    }
}

fn placeholder(params: &[Param]) -> String {
    let cast = params
        .last()
        .and_then(|p| p.data_type.as_deref())
        .and_then(cast_for_pg_type)
        .map(|c| format!("::{c}"))
        .unwrap_or_default();
    format!("${}{cast}", params.len())
}

/// `UPDATE table AS t SET ... WHERE pk = ... [AND version = ...]`
pub fn update(entity: Option<&EntitySchema>, statement: &UpdateStatement) -> anyhow::Result<Statement> {
    if statement.values.is_empty() {
        bail!("empty update on {}", statement.table);
    }
    let mut params = Vec::new();
    let mut sets = Vec::with_capacity(statement.values.len());
    for (column, value) in &statement.values {
        params.push(param_for(entity, column, value.clone()));
        sets.push(format!("{} = {}", quote_ident(column)?, placeholder(&params)));
    }

    let mut conditions = key_conditions(entity, &statement.key, &mut params)?;
    conditions.extend(guard_condition(statement.guard.as_ref(), &mut params)?);

    Ok(Statement {
        sql: format!(
            "UPDATE {} AS t SET {} WHERE {}",
            quote_table(&statement.table)?,
            sets.join(", "),
            conditions.join(" AND ")
        ),
        params,
    })
}

pub fn delete(entity: Option<&EntitySchema>, statement: &DeleteStatement) -> anyhow::Result<Statement> {
    let mut params = Vec::new();
    let mut conditions = key_conditions(entity, &statement.key, &mut params)?;
    conditions.extend(guard_condition(statement.guard.as_ref(), &mut params)?);

    Ok(Statement {
        sql: format!(
            "DELETE FROM {} AS t WHERE {}",
            quote_table(&statement.table)?,
            conditions.join(" AND ")
        ),
        params,
    })
}

pub fn insert(entity: &EntitySchema, values: &Row) -> anyhow::Result<Statement> {
    let table = quote_table(&entity.name)?;
    if values.is_empty() {
        return Ok(Statement {
            sql: format!("INSERT INTO {table} AS t DEFAULT VALUES RETURNING to_jsonb(t) AS row"),
            params: Vec::new(),
        });
    }

    let mut params = Vec::new();
    let mut columns = Vec::with_capacity(values.len());
    let mut placeholders = Vec::with_capacity(values.len());
    for (column, value) in values {
        params.push(param_for(Some(entity), column, value.clone()));
        columns.push(quote_ident(column)?);
        placeholders.push(placeholder(&params));
    }

    Ok(Statement {
        sql: format!(
            "INSERT INTO {table} AS t ({}) VALUES ({}) RETURNING to_jsonb(t) AS row",
            columns.join(", "),
            placeholders.join(", ")
        ),
        params,
    })
}

pub fn find(entity: &EntitySchema, key: &Row) -> anyhow::Result<Statement> {
    let mut params = Vec::new();
    let conditions = key_conditions(Some(entity), key, &mut params)?;
    Ok(Statement {
        sql: format!(
            "SELECT to_jsonb(t) AS row FROM {} AS t WHERE {} LIMIT 1",
            quote_table(&entity.name)?,
            conditions.join(" AND ")
        ),
        params,
    })
}
