//! Backend-neutral query AST.
//!
//! The planner produces a [`Query`] tree; adapters render and execute it.
//! Nothing here knows about SQL dialects beyond operator symbols.

use quarry_core::{ColumnKind, Connective, Direction, Operator};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

// =============================================================================
// PREDICATES
// =============================================================================

/// A single condition in a WHERE clause.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// `column <op> value`
    Compare {
        column: String,
        operator: Operator,
        value: Value,
    },
    /// `column IS [NOT] NULL`
    Null { column: String, negated: bool },
    /// `column [NOT] LIKE pattern`; the pattern is passed through unchanged.
    Like {
        column: String,
        pattern: Value,
        negated: bool,
    },
    /// An isolated sub-clause, rendered in parentheses.
    Group(Vec<Where>),
    /// A related row matching `query` exists.
    Exists { relation: String, query: Box<Query> },
}

/// A predicate and the connective joining it to the previous one.
///
/// The connective of the first entry in a list is ignored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Where {
    pub boolean: Connective,
    pub predicate: Predicate,
}

impl Where {
    pub fn and(predicate: Predicate) -> Self {
        Self {
            boolean: Connective::And,
            predicate,
        }
    }

    pub fn or(predicate: Predicate) -> Self {
        Self {
            boolean: Connective::Or,
            predicate,
        }
    }
}

// =============================================================================
// AGGREGATES
// =============================================================================

/// Aggregate functions understood by adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Max,
    Min,
    Exists,
}

impl AggregateKind {
    /// Map a requested column kind to its aggregate, if it is one.
    pub fn from_column_kind(kind: ColumnKind) -> Option<Self> {
        match kind {
            ColumnKind::Column => None,
            ColumnKind::Count => Some(Self::Count),
            ColumnKind::Sum => Some(Self::Sum),
            ColumnKind::Avg => Some(Self::Avg),
            ColumnKind::Max => Some(Self::Max),
            ColumnKind::Min => Some(Self::Min),
            ColumnKind::Exists => Some(Self::Exists),
        }
    }

    /// Whether the aggregate reads a column value (as opposed to counting rows).
    pub fn needs_column(self) -> bool {
        !matches!(self, Self::Count | Self::Exists)
    }

    pub fn sql_function(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Exists => "EXISTS",
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_function().to_ascii_lowercase())
    }
}

/// An aggregate computed per row over one relation, or over the whole
/// filtered set when `relation` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    pub relation: Option<String>,
    pub kind: AggregateKind,
    pub column: Option<String>,
    pub alias: String,
}

impl Aggregate {
    /// `{relation}_{kind}` for row-counting kinds, `{relation}_{kind}_{column}` otherwise.
    pub fn relation(relation: impl Into<String>, kind: AggregateKind, column: Option<String>) -> Self {
        let relation = relation.into();
        let column = column.filter(|_| kind.needs_column());
        let alias = match &column {
            Some(column) => format!("{relation}_{kind}_{column}"),
            None => format!("{relation}_{kind}"),
        };
        Self {
            relation: Some(relation),
            kind,
            column,
            alias,
        }
    }

    /// A scalar aggregate over the main result set.
    pub fn total(kind: AggregateKind, column: Option<String>) -> Self {
        let column = column.filter(|_| kind.needs_column());
        let alias = match &column {
            Some(column) => format!("{kind}_{column}"),
            None => kind.to_string(),
        };
        Self {
            relation: None,
            kind,
            column,
            alias,
        }
    }
}

// =============================================================================
// QUERY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

/// A relation to load alongside the parent rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EagerLoad {
    /// Relation name on the parent entity (one segment).
    pub relation: String,
    pub query: Query,
}

/// A read query against one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    pub entity: String,
    /// Selected columns; empty means every column.
    pub select: Vec<String>,
    pub wheres: Vec<Where>,
    pub orders: Vec<Order>,
    pub aggregates: Vec<Aggregate>,
    pub totals: Vec<Aggregate>,
    pub eager: Vec<EagerLoad>,
    /// Include soft-deleted rows.
    pub with_trashed: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Query {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            select: Vec::new(),
            wheres: Vec::new(),
            orders: Vec::new(),
            aggregates: Vec::new(),
            totals: Vec::new(),
            eager: Vec::new(),
            with_trashed: false,
            limit: None,
            offset: None,
        }
    }

    pub fn push_where(&mut self, clause: Where) {
        self.wheres.push(clause);
    }

    /// Append a list of conditions as one AND operand. When the query already
    /// has conditions the new ones are isolated in a group, and existing
    /// conditions joined by OR are grouped too, so the result always reads
    /// `(existing) AND (new)`.
    pub fn push_wheres(&mut self, clauses: Vec<Where>) {
        if clauses.is_empty() {
            return;
        }
        if self.wheres.is_empty() {
            self.wheres = clauses;
            return;
        }
        if self
            .wheres
            .iter()
            .skip(1)
            .any(|clause| clause.boolean == Connective::Or)
        {
            let existing = std::mem::take(&mut self.wheres);
            self.wheres.push(Where::and(Predicate::Group(existing)));
        }
        self.wheres.push(Where::and(Predicate::Group(clauses)));
    }

    pub fn order_by(&mut self, column: impl Into<String>, direction: Direction) {
        self.orders.push(Order {
            column: column.into(),
            direction,
        });
    }

    /// The eager load at a dotted relation path.
    pub fn eager(&self, path: &str) -> Option<&Query> {
        let mut current = self;
        for segment in path.split('.') {
            current = &current.eager.iter().find(|e| e.relation == segment)?.query;
        }
        Some(current)
    }

    pub fn eager_mut(&mut self, path: &str) -> Option<&mut Query> {
        let mut current = self;
        for segment in path.split('.') {
            current = &mut current
                .eager
                .iter_mut()
                .find(|e| e.relation == segment)?
                .query;
        }
        Some(current)
    }

    /// Attach an eager load under this query.
    pub fn with(&mut self, relation: impl Into<String>, query: Query) {
        self.eager.push(EagerLoad {
            relation: relation.into(),
            query,
        });
    }

    /// Dotted paths of every eager load, parents before children.
    pub fn eager_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(self, "", &mut out);
        out
    }
}

fn collect_paths(query: &Query, prefix: &str, out: &mut Vec<String>) {
    for load in &query.eager {
        let path = if prefix.is_empty() {
            load.relation.clone()
        } else {
            format!("{prefix}.{}", load.relation)
        };
        out.push(path.clone());
        collect_paths(&load.query, &path, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_alias() {
        assert_eq!(
            Aggregate::relation("orders", AggregateKind::Count, Some("id".into())).alias,
            "orders_count"
        );
        assert_eq!(
            Aggregate::relation("items", AggregateKind::Sum, Some("price".into())).alias,
            "items_sum_price"
        );
        assert_eq!(
            Aggregate::total(AggregateKind::Max, Some("total".into())).alias,
            "max_total"
        );
    }

    #[test]
    fn test_push_wheres_isolates_when_not_empty() {
        let mut query = Query::new("orders");
        query.push_wheres(vec![Where::and(Predicate::Null {
            column: "deleted_at".into(),
            negated: false,
        })]);
        query.push_wheres(vec![
            Where::or(Predicate::Null {
                column: "a".into(),
                negated: true,
            }),
            Where::or(Predicate::Null {
                column: "b".into(),
                negated: true,
            }),
        ]);

        assert_eq!(query.wheres.len(), 2);
        assert!(matches!(&query.wheres[1].predicate, Predicate::Group(g) if g.len() == 2));
    }

    #[test]
    fn test_push_wheres_groups_existing_or_list() {
        let null = |column: &str| Predicate::Null {
            column: column.into(),
            negated: false,
        };
        let mut query = Query::new("orders");
        query.push_wheres(vec![Where::and(null("a")), Where::or(null("b"))]);
        query.push_wheres(vec![Where::and(null("id"))]);

        assert_eq!(
            query.wheres,
            vec![
                Where::and(Predicate::Group(vec![
                    Where::and(null("a")),
                    Where::or(null("b")),
                ])),
                Where::and(Predicate::Group(vec![Where::and(null("id"))])),
            ]
        );
    }

    #[test]
    fn test_eager_paths_and_lookup() {
        let mut address = Query::new("addresses");
        address.select = vec!["id".into()];
        let mut customer = Query::new("customers");
        customer.with("address", address);
        let mut orders = Query::new("orders");
        orders.with("customer", customer);

        assert_eq!(orders.eager_paths(), vec!["customer", "customer.address"]);
        assert_eq!(orders.eager("customer.address").unwrap().entity, "addresses");
        assert!(orders.eager("customer.missing").is_none());
        orders.eager_mut("customer").unwrap().limit = Some(5);
        assert_eq!(orders.eager("customer").unwrap().limit, Some(5));
    }
}
