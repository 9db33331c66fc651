//! Change-tracked records.

use quarry_core::EntitySchema;
use serde_json::{Map, Value};

/// A row as a JSON object.
pub type Row = Map<String, Value>;

/// One row of an entity plus the values last synchronized with storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    entity: String,
    attributes: Row,
    original: Row,
    exists: bool,
}

impl Record {
    /// A record that has not been stored yet.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            attributes: Row::new(),
            original: Row::new(),
            exists: false,
        }
    }

    /// A record loaded from storage.
    pub fn from_row(entity: impl Into<String>, row: Row) -> Self {
        Self {
            entity: entity.into(),
            original: row.clone(),
            attributes: row,
            exists: true,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.attributes.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(column.into(), value.into());
    }

    pub fn fill(&mut self, values: Row) {
        self.attributes.extend(values);
    }

    pub fn attributes(&self) -> &Row {
        &self.attributes
    }

    pub fn into_attributes(self) -> Row {
        self.attributes
    }

    /// Attributes that differ from the last synchronized state.
    pub fn dirty(&self) -> Row {
        self.attributes
            .iter()
            .filter(|(column, value)| self.original.get(*column) != Some(*value))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.attributes
            .iter()
            .any(|(column, value)| self.original.get(column) != Some(value))
    }

    /// Primary key values as last synchronized with storage.
    pub fn key(&self, entity: &EntitySchema) -> Option<Row> {
        entity
            .primary_key()
            .iter()
            .map(|pk| {
                self.original
                    .get(pk)
                    .filter(|v| !v.is_null())
                    .map(|v| (pk.clone(), v.clone()))
            })
            .collect()
    }

    /// Current integer value of a version column; `None` when unversioned.
    pub fn version(&self, column: &str) -> Option<i64> {
        self.attributes.get(column).and_then(Value::as_i64)
    }

    pub(crate) fn set_version(&mut self, column: &str, version: Option<i64>) {
        match version {
            Some(v) => {
                self.attributes.insert(column.to_string(), Value::from(v));
            }
            None => match self.original.get(column) {
                Some(original) => {
                    self.attributes.insert(column.to_string(), original.clone());
                }
                None => {
                    self.attributes.remove(column);
                }
            },
        }
    }

    /// Replace attributes with a stored row and mark everything clean.
    pub(crate) fn persisted(&mut self, row: Row) {
        self.attributes = row;
        self.sync_original();
        self.exists = true;
    }

    pub(crate) fn sync_original(&mut self) {
        self.original = self.attributes.clone();
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.exists = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_dirty_tracks_changes_against_original() {
        let mut record = Record::from_row("orders", row(json!({ "id": 1, "status": "new" })));
        assert!(!record.is_dirty());

        record.set("status", "paid");
        record.set("note", "rush");
        let dirty = record.dirty();
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty["status"], json!("paid"));

        record.sync_original();
        assert!(!record.is_dirty());
    }

    #[test]
    fn test_set_version_none_restores_original() {
        let mut record = Record::from_row("orders", row(json!({ "id": 1 })));
        record.set("lock_version", 1);
        record.set_version("lock_version", None);
        assert!(record.get("lock_version").is_none());

        let mut versioned = Record::from_row("orders", row(json!({ "id": 1, "lock_version": 3 })));
        versioned.set_version("lock_version", Some(4));
        assert_eq!(versioned.version("lock_version"), Some(4));
    }
}
