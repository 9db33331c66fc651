//! Storage contracts used by the lock guard and the CRUD service.

use async_trait::async_trait;
use quarry_core::EntitySchema;
use quarry_planner::Query;
use serde::Serialize;

use crate::record::Row;

/// `AND {column} = expected` on an UPDATE or DELETE; `IS NULL` when the
/// row has never been versioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionGuard {
    pub column: String,
    pub expected: Option<i64>,
}

/// A single-row UPDATE keyed by primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub key: Row,
    pub values: Row,
    pub guard: Option<VersionGuard>,
}

/// A single-row DELETE keyed by primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub key: Row,
    pub guard: Option<VersionGuard>,
}

/// Writes and primary-key lookups.
///
/// `update` and `delete` must each run as one atomic statement and report
/// the number of affected rows.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert a row and return it as stored (generated keys included).
    async fn insert(&self, entity: &EntitySchema, values: &Row) -> anyhow::Result<Row>;

    async fn update(&self, statement: &UpdateStatement) -> anyhow::Result<u64>;

    async fn delete(&self, statement: &DeleteStatement) -> anyhow::Result<u64>;

    async fn find(&self, entity: &EntitySchema, key: &Row) -> anyhow::Result<Option<Row>>;
}

/// Rows returned for a planned query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Scalar aggregates over the whole filtered set, keyed by alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals: Option<Row>,
}

/// Executes planned read queries, eager loads included.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn fetch(&self, query: &Query) -> anyhow::Result<QueryResult>;
}
