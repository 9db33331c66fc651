//! Stitching eager-loaded rows onto their parents.

use quarry_runtime::Row;
use serde_json::Value;
use std::collections::HashMap;

use crate::sql::PARENT_KEY;

/// Distinct non-null values of `column` across `rows`, in first-seen order.
pub(crate) fn parent_keys(rows: &[Row], column: &str) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    rows.iter()
        .filter_map(|row| row.get(column))
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(v.to_string()))
        .cloned()
        .collect()
}

/// Attach `children` to `parents` under `relation`, matching each child's
/// [`PARENT_KEY`] against the parent's `local_key`. Single relations get an
/// object or `null`; the rest get an array.
pub(crate) fn stitch(
    parents: &mut [Row],
    relation: &str,
    local_key: &str,
    single: bool,
    children: Vec<Row>,
) {
    let mut grouped: HashMap<String, Vec<Row>> = HashMap::new();
    for mut child in children {
        let Some(key) = child.remove(PARENT_KEY) else {
            continue;
        };
        grouped.entry(key.to_string()).or_default().push(child);
    }

    for parent in parents.iter_mut() {
        let matched = parent
            .get(local_key)
            .filter(|v| !v.is_null())
            .and_then(|key| grouped.get(&key.to_string()))
            .cloned()
            .unwrap_or_default();

        let value = if single {
            matched.into_iter().next().map_or(Value::Null, Value::Object)
        } else {
            Value::Array(matched.into_iter().map(Value::Object).collect())
        };
        parent.insert(relation.to_string(), value);
    }
}
