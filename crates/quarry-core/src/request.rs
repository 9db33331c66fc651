//! Request value objects.
//!
//! These are the wire shapes accepted from the validation layer: requested
//! columns (plain or aggregate), boolean filter trees and sorts. They are
//! constructed fresh per request and consumed read-only by the planner.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// COLUMNS
// =============================================================================

/// What a requested column computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnKind {
    /// A stored column.
    #[default]
    Column,
    Sum,
    Count,
    Avg,
    Max,
    Min,
    /// Whether at least one related row exists.
    Exists,
}

impl ColumnKind {
    /// Returns true for every kind computed over a relation.
    pub fn is_aggregate(self) -> bool {
        !matches!(self, ColumnKind::Column)
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Column => "column",
            ColumnKind::Sum => "sum",
            ColumnKind::Count => "count",
            ColumnKind::Avg => "avg",
            ColumnKind::Max => "max",
            ColumnKind::Min => "min",
            ColumnKind::Exists => "exists",
        };
        f.write_str(name)
    }
}

/// A requested column, possibly a dotted relation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default)]
    pub kind: ColumnKind,
}

impl Column {
    /// A plain stored column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Column,
        }
    }

    /// An aggregate column.
    pub fn aggregate(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Column descriptor as it arrives on the wire: a bare name or `{name, kind}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRequest {
    Name(String),
    Descriptor(Column),
}

impl From<ColumnRequest> for Column {
    fn from(request: ColumnRequest) -> Self {
        match request {
            ColumnRequest::Name(name) => Column::new(name),
            ColumnRequest::Descriptor(column) => column,
        }
    }
}

impl From<&str> for ColumnRequest {
    fn from(name: &str) -> Self {
        ColumnRequest::Name(name.to_string())
    }
}

// =============================================================================
// FILTERS
// =============================================================================

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=", alias = "==")]
    Equals,
    #[serde(rename = "!=", alias = "<>")]
    NotEquals,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "not like")]
    NotLike,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
}

impl Operator {
    /// The SQL symbol for this operator.
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
        }
    }

    pub fn is_pattern(self) -> bool {
        matches!(self, Operator::Like | Operator::NotLike)
    }
}

/// Logical connective joining the members of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Connective {
    #[default]
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

impl fmt::Display for Connective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connective::And => f.write_str("AND"),
            Connective::Or => f.write_str("OR"),
        }
    }
}

/// A single comparison. `property` is a dotted path: zero or more relation
/// hops followed by a field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterLeaf {
    pub property: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl FilterLeaf {
    pub fn new(property: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            operator,
            value: value.into(),
        }
    }
}

/// A member of a filter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Group(FiltersGroup),
    Leaf(FilterLeaf),
}

impl From<FilterLeaf> for Filter {
    fn from(leaf: FilterLeaf) -> Self {
        Filter::Leaf(leaf)
    }
}

impl From<FiltersGroup> for Filter {
    fn from(group: FiltersGroup) -> Self {
        Filter::Group(group)
    }
}

/// A boolean filter tree node. The tree terminates only in leaves.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FiltersGroup {
    #[serde(default)]
    pub operator: Connective,
    pub filters: Vec<Filter>,
}

impl FiltersGroup {
    pub fn new(operator: Connective, filters: Vec<Filter>) -> Self {
        Self { operator, filters }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Self::new(Connective::And, filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Self::new(Connective::Or, filters)
    }

    /// A flat list of leaves is an implicit AND group.
    pub fn from_leaves(leaves: impl IntoIterator<Item = FilterLeaf>) -> Self {
        Self::and(leaves.into_iter().map(Filter::Leaf).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Iterate over every leaf in the tree, depth first.
    pub fn leaves(&self) -> Vec<&FilterLeaf> {
        let mut out = Vec::new();
        collect_leaves(self, &mut out);
        out
    }
}

fn collect_leaves<'a>(group: &'a FiltersGroup, out: &mut Vec<&'a FilterLeaf>) {
    for filter in &group.filters {
        match filter {
            Filter::Leaf(leaf) => out.push(leaf),
            Filter::Group(inner) => collect_leaves(inner, out),
        }
    }
}

/// Filters as accepted on the wire: an explicit group or a bare list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterInput {
    Group(FiltersGroup),
    List(Vec<Filter>),
}

impl From<FilterInput> for FiltersGroup {
    fn from(input: FilterInput) -> Self {
        match input {
            FilterInput::Group(group) => group,
            FilterInput::List(filters) => FiltersGroup::and(filters),
        }
    }
}

// =============================================================================
// SORTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub property: String,
    #[serde(default)]
    pub direction: Direction,
}

impl Sort {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Desc,
        }
    }
}

// =============================================================================
// REQUEST
// =============================================================================

/// A validated read request against one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Requested columns, plain or aggregate, possibly relation-prefixed.
    #[serde(default)]
    pub columns: Vec<ColumnRequest>,

    /// Filters on the main entity (may traverse relations).
    #[serde(default)]
    pub filters: Option<FilterInput>,

    #[serde(default)]
    pub sort: Vec<Sort>,

    /// Relations to eager-load even when no column asks for them.
    #[serde(default, alias = "include")]
    pub relations: Vec<String>,

    /// Filters scoped to an eager-loaded relation, keyed by relation path.
    #[serde(default)]
    pub relation_filters: BTreeMap<String, FilterInput>,

    #[serde(default)]
    pub limit: Option<u64>,

    #[serde(default)]
    pub offset: Option<u64>,

    /// Include soft-deleted rows of the main entity (requires delete permission).
    #[serde(default)]
    pub with_trashed: bool,
}

impl QueryRequest {
    pub fn columns(&self) -> Vec<Column> {
        self.columns.iter().cloned().map(Column::from).collect()
    }

    pub fn filters(&self) -> Option<FiltersGroup> {
        self.filters.clone().map(FiltersGroup::from)
    }

    pub fn relation_filters(&self, path: &str) -> Option<FiltersGroup> {
        self.relation_filters.get(path).cloned().map(FiltersGroup::from)
    }
}
