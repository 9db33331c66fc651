//! `quarry check` command implementation.
//!
//! Loads the configuration, resolves the schema registry and reports:
//! - registry build errors (unknown entities, unresolved or ambiguous keys)
//! - relations without an inverse, or with more than one
//! - capability columns that the entity does not declare

use anyhow::Result;
use quarry_core::{EntitySchema, QuarryConfig, SchemaError, SchemaRegistry};
use std::path::Path;

// ============================================================================
// Check Result Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// A single check finding.
#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub severity: Severity,
    /// Category of the check that produced this finding.
    pub category: String,
    pub message: String,
    /// Location in the schema, e.g. `orders.customer`.
    pub location: Option<String>,
}

impl CheckFinding {
    fn new(severity: Severity, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            category: category.into(),
            message: message.into(),
            location: None,
        }
    }

    fn error(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, category, message)
    }

    fn warning(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, message)
    }

    fn info(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, category, message)
    }

    fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

#[derive(Debug, Default)]
pub struct CheckResults {
    pub findings: Vec<CheckFinding>,
}

impl CheckResults {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    /// Print findings, most severe first.
    pub fn print_summary(&self) {
        let mut findings: Vec<_> = self.findings.iter().collect();
        findings.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.category.cmp(&b.category))
        });

        for finding in findings {
            let location = finding
                .location
                .as_deref()
                .map(|l| format!(" [{l}]"))
                .unwrap_or_default();
            println!(
                "  {} [{}]{}: {}",
                finding.severity, finding.category, location, finding.message
            );
        }
        println!(
            "\n{} error(s), {} warning(s)",
            self.count(Severity::Error),
            self.count(Severity::Warning)
        );
    }
}

// ============================================================================
// Main Check Runner
// ============================================================================

pub fn run(config_path: &Path) -> Result<CheckResults> {
    let config = QuarryConfig::load_with_context(config_path)?;
    Ok(check_config(&config))
}

pub fn check_config(config: &QuarryConfig) -> CheckResults {
    let mut results = CheckResults::default();

    let registry = match config.build_registry() {
        Ok(registry) => registry,
        Err(err) => {
            results
                .findings
                .push(CheckFinding::error("schema", err.to_string()));
            return results;
        }
    };
    tracing::debug!(entities = registry.len(), "registry built");

    let mut entities: Vec<&EntitySchema> = registry.entities().collect();
    entities.sort_by(|a, b| a.name.cmp(&b.name));
    for entity in entities {
        results.findings.extend(check_relations(&registry, entity, config));
        results.findings.extend(check_capabilities(entity, config));
    }
    results
}

fn check_relations(
    registry: &SchemaRegistry,
    entity: &EntitySchema,
    config: &QuarryConfig,
) -> Vec<CheckFinding> {
    let mut findings = Vec::new();
    for relation in &entity.relations {
        let location = format!("{}.{}", entity.name, relation.name);

        if config.planner.is_blacklisted(&relation.name) {
            findings.push(
                CheckFinding::info("relations", "never eager-loaded (blacklisted)")
                    .with_location(&location),
            );
        }

        match registry.inverse_of(&entity.name, &relation.name) {
            Ok(Some(inverse)) => findings.push(
                CheckFinding::info(
                    "relations",
                    format!("inverse of {}.{}", relation.related, inverse.name),
                )
                .with_location(&location),
            ),
            Ok(None) => {}
            Err(err @ SchemaError::AmbiguousRelation { .. }) => findings
                .push(CheckFinding::warning("relations", err.to_string()).with_location(&location)),
            Err(err) => findings
                .push(CheckFinding::error("relations", err.to_string()).with_location(&location)),
        }
    }
    findings
}

fn check_capabilities(entity: &EntitySchema, config: &QuarryConfig) -> Vec<CheckFinding> {
    // Entities declared without columns are left to the database.
    if entity.columns.is_empty() {
        return Vec::new();
    }

    let mut expected = Vec::new();
    if let Some(column) = entity.soft_delete_column() {
        expected.push(("soft_deletes", column));
    }
    if let Some(ts) = entity.timestamps() {
        expected.push(("timestamps", ts.created_at.as_str()));
        expected.push(("timestamps", ts.updated_at.as_str()));
    }
    if entity.is_lockable() {
        expected.push(("lockable", config.locking.version_column.as_str()));
    }

    expected
        .into_iter()
        .filter(|(_, column)| entity.column(column).is_none())
        .map(|(capability, column)| {
            CheckFinding::warning(
                "capabilities",
                format!("{capability} expects column '{column}', which is not declared"),
            )
            .with_location(&entity.name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, schema: &str) -> std::path::PathBuf {
        fs::write(dir.path().join("schema.yaml"), schema).unwrap();
        let path = dir.path().join("quarry.yaml");
        fs::write(&path, "schema_file: schema.yaml\n").unwrap();
        path
    }

    #[test]
    fn test_valid_schema_has_no_errors() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
entities:
  - name: customers
    columns: [{ name: id }, { name: name }]
    relations:
      - { name: orders, kind: has_many, related: orders, foreign_key: customer_id }
  - name: orders
    columns: [{ name: id }, { name: customer_id }, { name: lock_version }]
    lockable: true
    relations:
      - { name: customer, kind: belongs_to, related: customers, local_key: customer_id }
"#,
        );

        let results = run(&path).unwrap();
        assert!(!results.has_errors());
        assert_eq!(results.count(Severity::Warning), 0);
        assert!(
            results
                .findings
                .iter()
                .any(|f| f.location.as_deref() == Some("orders.customer"))
        );
    }

    #[test]
    fn test_unknown_related_entity_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
entities:
  - name: orders
    relations:
      - { name: customer, kind: belongs_to, related: customers, local_key: customer_id }
"#,
        );

        let results = run(&path).unwrap();
        assert!(results.has_errors());
    }

    #[test]
    fn test_missing_capability_column_warns() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
entities:
  - name: notes
    columns: [{ name: id }, { name: body }]
    soft_deletes: deleted_at
    lockable: true
"#,
        );

        let results = run(&path).unwrap();
        assert_eq!(results.count(Severity::Warning), 2);
    }
}
