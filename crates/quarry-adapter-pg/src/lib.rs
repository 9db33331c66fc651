//! # quarry-adapter-pg
//!
//! PostgreSQL backend for Quarry: executes planned queries (eager loads and
//! totals included), performs version-guarded writes for the lock guard and
//! introspects `information_schema` into schema definitions.

use async_trait::async_trait;
use quarry_core::{DatabaseConfig, EntitySchema, SchemaRegistry};
use quarry_planner::{EagerLoad, Query};
use quarry_runtime::{
    DeleteStatement, QueryExecutor, QueryResult, Row, RowStore, UpdateStatement,
};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::{Arguments, PgPool, Row as _};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub mod eager;
pub mod introspect;
pub mod sql;

use sql::{Param, SqlRenderer, Statement};

fn args_add<T>(args: &mut PgArguments, v: T) -> anyhow::Result<()>
where
    T: Send + Sync + 'static,
    for<'q> T: sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    args.add(v).map_err(|e| anyhow::anyhow!(e))
}

/// Bind one parameter, typed after the column it targets. Numeric and
/// temporal values travel as text and are cast in SQL.
fn bind_param(args: &mut PgArguments, param: &Param) -> anyhow::Result<()> {
    let v = &param.value;
    let Some(data_type) = param.data_type.as_deref() else {
        return bind_untyped(args, v);
    };

    if v.is_null() {
        match data_type {
            "uuid" => args_add(args, Option::<uuid::Uuid>::None)?,
            "boolean" => args_add(args, Option::<bool>::None)?,
            "integer" | "bigint" | "smallint" => args_add(args, Option::<i64>::None)?,
            "json" | "jsonb" => {
                args_add(args, Option::<sqlx::types::Json<Value>>::None)?
            }
            _ => args_add(args, Option::<String>::None)?,
        }
        return Ok(());
    }

    match data_type {
        "uuid" => {
            let s = v
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("expected uuid string, got {v}"))?;
            args_add(args, uuid::Uuid::parse_str(s)?)?;
        }
        "boolean" => {
            let b = v
                .as_bool()
                .ok_or_else(|| anyhow::anyhow!("expected boolean, got {v}"))?;
            args_add(args, b)?;
        }
        "integer" | "bigint" | "smallint" => {
            let n = match v {
                Value::String(s) => s.parse::<i64>()?,
                other => other
                    .as_i64()
                    .ok_or_else(|| anyhow::anyhow!("expected integer, got {other}"))?,
            };
            args_add(args, n)?;
        }
        "json" | "jsonb" => args_add(args, sqlx::types::Json(v.clone()))?,
        _ => {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            args_add(args, s)?;
        }
    }
    Ok(())
}

/// Bind by JSON shape when the column type is unknown.
fn bind_untyped(args: &mut PgArguments, v: &Value) -> anyhow::Result<()> {
    match v {
        Value::Null => args_add(args, Option::<String>::None),
        Value::Bool(b) => args_add(args, *b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => args_add(args, i),
            None => args_add(args, n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => args_add(args, s.clone()),
        other => args_add(args, sqlx::types::Json(other.clone())),
    }
}

fn arguments(statement: &Statement) -> anyhow::Result<PgArguments> {
    let mut args = PgArguments::default();
    for param in &statement.params {
        bind_param(&mut args, param)?;
    }
    Ok(args)
}

fn into_row(value: Value) -> anyhow::Result<Row> {
    match value {
        Value::Object(row) => Ok(row),
        other => Err(anyhow::anyhow!("expected a JSON object row, got {other}")),
    }
}

pub struct PgAdapter {
    pool: PgPool,
    registry: Arc<SchemaRegistry>,
}

impl PgAdapter {
    pub async fn connect(
        config: &DatabaseConfig,
        registry: Arc<SchemaRegistry>,
    ) -> anyhow::Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("database.url is not configured"))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool, registry))
    }

    pub fn from_pool(pool: PgPool, registry: Arc<SchemaRegistry>) -> Self {
        Self { pool, registry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_rows(&self, statement: Statement) -> anyhow::Result<Vec<Row>> {
        tracing::debug!(sql = %statement.sql, params = statement.params.len(), "executing");
        let args = arguments(&statement)?;
        let records = sqlx::query_with(&statement.sql, args)
            .fetch_all(&self.pool)
            .await?;
        records
            .into_iter()
            .map(|r| into_row(r.try_get::<Value, _>("row")?))
            .collect()
    }

    async fn execute(&self, statement: Statement) -> anyhow::Result<u64> {
        tracing::debug!(sql = %statement.sql, params = statement.params.len(), "executing");
        let args = arguments(&statement)?;
        let result = sqlx::query_with(&statement.sql, args)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Load each eager relation for `rows`, one query per relation level.
    fn load_eager<'b>(
        &'b self,
        parent: &'b EntitySchema,
        loads: &'b [EagerLoad],
        rows: &'b mut [Row],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'b>> {
        Box::pin(async move {
            for load in loads {
                let hop = self.registry.relation(parent, &load.relation)?;
                let single = hop.relation.kind.is_single();
                let keys = eager::parent_keys(rows, &hop.relation.local_key);

                let mut children = if keys.is_empty() {
                    Vec::new()
                } else {
                    let statement = SqlRenderer::new(&self.registry).eager(parent, load, &keys)?;
                    self.fetch_rows(statement).await?
                };
                if !load.query.eager.is_empty() && !children.is_empty() {
                    self.load_eager(hop.related, &load.query.eager, &mut children)
                        .await?;
                }

                eager::stitch(rows, &load.relation, &hop.relation.local_key, single, children);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl QueryExecutor for PgAdapter {
    async fn fetch(&self, query: &Query) -> anyhow::Result<QueryResult> {
        let entity = self.registry.entity(&query.entity)?;

        let statement = SqlRenderer::new(&self.registry).select(query)?;
        let mut rows = self.fetch_rows(statement).await?;
        self.load_eager(entity, &query.eager, &mut rows).await?;

        let totals = match SqlRenderer::new(&self.registry).totals(query)? {
            Some(statement) => self.fetch_rows(statement).await?.into_iter().next(),
            None => None,
        };

        Ok(QueryResult { rows, totals })
    }
}

#[async_trait]
impl RowStore for PgAdapter {
    async fn insert(&self, entity: &EntitySchema, values: &Row) -> anyhow::Result<Row> {
        let statement = sql::insert(entity, values)?;
        self.fetch_rows(statement)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("insert into {} returned no row", entity.name))
    }

    async fn update(&self, statement: &UpdateStatement) -> anyhow::Result<u64> {
        let entity = self.registry.get(&statement.table);
        self.execute(sql::update(entity.as_deref(), statement)?)
            .await
    }

    async fn delete(&self, statement: &DeleteStatement) -> anyhow::Result<u64> {
        let entity = self.registry.get(&statement.table);
        self.execute(sql::delete(entity.as_deref(), statement)?)
            .await
    }

    async fn find(&self, entity: &EntitySchema, key: &Row) -> anyhow::Result<Option<Row>> {
        Ok(self
            .fetch_rows(sql::find(entity, key)?)
            .await?
            .into_iter()
            .next())
    }
}
