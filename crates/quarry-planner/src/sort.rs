//! Deterministic SELECT lists.

use quarry_core::EntitySchema;

use crate::classifier::ALL_COLUMNS;

/// Turn requested column names into a SELECT list for `entity`.
///
/// Names are de-duplicated and sorted; the entity's primary key columns are
/// prepended, in declared order, when missing. An empty request or one
/// containing `*` selects every column and yields an empty list.
pub fn normalize_select(entity: &EntitySchema, columns: &[String]) -> Vec<String> {
    if columns.is_empty() || columns.iter().any(|c| c == ALL_COLUMNS) {
        return Vec::new();
    }

    let mut sorted: Vec<String> = columns.to_vec();
    sorted.sort();
    sorted.dedup();

    let missing: Vec<String> = entity
        .primary_key()
        .iter()
        .filter(|pk| !sorted.contains(pk))
        .cloned()
        .collect();

    missing.into_iter().chain(sorted).collect()
}
