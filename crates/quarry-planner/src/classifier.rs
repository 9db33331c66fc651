//! Column classification.
//!
//! Splits a flat list of requested columns into the main entity's columns,
//! per-relation columns and per-relation aggregates.

use quarry_core::Column;
use std::collections::HashMap;

/// Field used when a relation path names no column.
pub const ALL_COLUMNS: &str = "*";

/// Columns grouped by relation path, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buckets {
    entries: Vec<(String, Vec<Column>)>,
    seen: HashMap<String, usize>,
}

impl Buckets {
    pub fn push(&mut self, path: impl Into<String>, column: Column) {
        let path = path.into();
        match self.seen.get(&path) {
            Some(&idx) => self.entries[idx].1.push(column),
            None => {
                self.seen.insert(path.clone(), self.entries.len());
                self.entries.push((path, vec![column]));
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&[Column]> {
        self.seen
            .get(path)
            .map(|&idx| self.entries[idx].1.as_slice())
    }

    pub fn remove(&mut self, path: &str) -> Option<Vec<Column>> {
        let idx = self.seen.remove(path)?;
        let (_, columns) = self.entries.remove(idx);
        for slot in self.seen.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        Some(columns)
    }

    /// Field names of the columns at `path`.
    pub fn names(&self, path: &str) -> Vec<String> {
        self.get(path)
            .map(|cols| cols.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Relation paths in first-seen order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(path, _)| path.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Column])> {
        self.entries
            .iter()
            .map(|(path, columns)| (path.as_str(), columns.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of [`classify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub main: Vec<Column>,
    pub relations: Buckets,
    /// Aggregates keyed by relation path. The empty path holds aggregates
    /// over the main entity itself.
    pub aggregates: Buckets,
}

/// Classify requested columns for `entity`.
///
/// A leading `{entity}.` is stripped first. A plain column with no dot left
/// belongs to the main entity. Anything else is split on its last dot into a
/// relation path and a field (`*` when empty).
pub fn classify(entity: &str, columns: &[Column]) -> Classified {
    let mut out = Classified::default();

    for column in columns {
        let name = strip_entity(entity, &column.name);

        if !column.kind.is_aggregate() && !name.contains('.') {
            out.main.push(Column::new(name));
            continue;
        }

        let (path, field) = name.rsplit_once('.').unwrap_or(("", name));
        let field = if field.is_empty() { ALL_COLUMNS } else { field };
        let classified = Column::aggregate(field, column.kind);

        if column.kind.is_aggregate() {
            out.aggregates.push(path, classified);
        } else {
            out.relations.push(path, classified);
        }
    }

    out
}

/// Strip a leading `{entity}.` from a dotted path.
pub fn strip_entity<'a>(entity: &str, path: &'a str) -> &'a str {
    path.strip_prefix(entity)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ColumnKind;

    fn names(columns: &[Column]) -> Vec<&str> {
        columns.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_classify_buckets() {
        let classified = classify(
            "orders",
            &[
                Column::new("orders.total"),
                Column::new("customer.name"),
                Column::aggregate("customer.orders.count", ColumnKind::Count),
            ],
        );

        assert_eq!(names(&classified.main), vec!["total"]);
        assert_eq!(names(classified.relations.get("customer").unwrap()), vec!["name"]);
        let aggregates = classified.aggregates.get("customer.orders").unwrap();
        assert_eq!(names(aggregates), vec!["count"]);
        assert_eq!(aggregates[0].kind, ColumnKind::Count);
    }

    #[test]
    fn test_relation_order_is_first_seen() {
        let classified = classify(
            "orders",
            &[
                Column::new("items.sku"),
                Column::new("customer.name"),
                Column::new("items.qty"),
                Column::new("customer.address.city"),
            ],
        );

        let paths: Vec<&str> = classified.relations.paths().collect();
        assert_eq!(paths, vec!["items", "customer", "customer.address"]);
        assert_eq!(names(classified.relations.get("items").unwrap()), vec!["sku", "qty"]);
    }

    #[test]
    fn test_empty_field_means_all_columns() {
        let classified = classify("orders", &[Column::new("customer.")]);
        assert_eq!(names(classified.relations.get("customer").unwrap()), vec!["*"]);
    }

    #[test]
    fn test_unprefixed_aggregate_is_keyed_by_empty_path() {
        let classified = classify(
            "orders",
            &[
                Column::aggregate("total", ColumnKind::Sum),
                Column::aggregate("orders.total", ColumnKind::Max),
            ],
        );
        let totals = classified.aggregates.get("").unwrap();
        assert_eq!(names(totals), vec!["total", "total"]);
        assert!(classified.main.is_empty());
    }

    #[test]
    fn test_buckets_remove_keeps_order() {
        let mut buckets = Buckets::default();
        buckets.push("a", Column::new("x"));
        buckets.push("b", Column::new("y"));
        buckets.push("c", Column::new("z"));

        assert!(buckets.remove("a").is_some());
        buckets.push("c", Column::new("w"));

        let paths: Vec<&str> = buckets.paths().collect();
        assert_eq!(paths, vec!["b", "c"]);
        assert_eq!(names(buckets.get("c").unwrap()), vec!["z", "w"]);
    }
}
