//! Schema introspection.
//!
//! Reads tables, columns, primary keys and foreign keys from
//! `information_schema` and turns them into a [`SchemaDefinition`]. Each
//! single-column foreign key yields a `belongs_to` relation on the
//! referencing table and a `has_many` relation back from the referenced one.
//! Capabilities are detected by column name.

use quarry_core::{
    Capabilities, ColumnSchema, EntityDefinition, ForeignKey, ForeignKeyTarget, LockingConfig,
    RelationDefinition, RelationKind, SchemaDefinition, TimestampColumns,
};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

/// Column names that switch on entity capabilities.
#[derive(Debug, Clone)]
pub struct IntrospectOptions {
    /// Database schema to read.
    pub schema: String,
    pub soft_delete_column: String,
    pub timestamps: TimestampColumns,
    pub version_column: String,
}

impl IntrospectOptions {
    pub fn new(locking: &LockingConfig) -> Self {
        Self {
            schema: "public".to_string(),
            soft_delete_column: "deleted_at".to_string(),
            timestamps: TimestampColumns::default(),
            version_column: locking.version_column.clone(),
        }
    }
}

/// One table as read from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

pub async fn introspect(pool: &PgPool, options: &IntrospectOptions) -> anyhow::Result<SchemaDefinition> {
    let (version,): (String,) = sqlx::query_as("select version()").fetch_one(pool).await?;
    tracing::info!(%version, schema = %options.schema, "introspecting");

    let table_rows = sqlx::query(
        r#"
        select table_name
        from information_schema.tables
        where table_type = 'BASE TABLE'
          and table_schema = $1
        order by table_name
        "#,
    )
    .bind(&options.schema)
    .fetch_all(pool)
    .await?;

    let mut tables = Vec::with_capacity(table_rows.len());
    for row in table_rows {
        let table_name: String = row.get("table_name");
        tables.push(read_table(pool, &options.schema, &table_name).await?);
    }

    Ok(derive_definition(tables, options))
}

async fn read_table(pool: &PgPool, schema: &str, table: &str) -> anyhow::Result<TableInfo> {
    let col_rows = sqlx::query(
        r#"
        select column_name, data_type, is_nullable, column_default
        from information_schema.columns
        where table_schema = $1 and table_name = $2
        order by ordinal_position
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await?;

    let columns = col_rows
        .into_iter()
        .map(|c| {
            let is_nullable: String = c.get("is_nullable");
            ColumnSchema {
                name: c.get("column_name"),
                data_type: c.get("data_type"),
                nullable: is_nullable == "YES",
                default: c.get("column_default"),
            }
        })
        .collect();

    let pk_rows = sqlx::query(
        r#"
        select kcu.column_name
        from information_schema.table_constraints tc
        join information_schema.key_column_usage kcu
          on tc.constraint_name = kcu.constraint_name
         and tc.table_schema = kcu.table_schema
        where tc.constraint_type = 'PRIMARY KEY'
          and tc.table_schema = $1
          and tc.table_name = $2
        order by kcu.ordinal_position
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await?;

    let primary_key = pk_rows
        .into_iter()
        .map(|r| r.get::<String, _>("column_name"))
        .collect();

    let fk_rows = sqlx::query(
        r#"
        select
          tc.constraint_name,
          kcu.column_name as column_name,
          ccu.table_name as foreign_table_name,
          ccu.column_name as foreign_column_name
        from information_schema.table_constraints tc
        join information_schema.key_column_usage kcu
          on tc.constraint_name = kcu.constraint_name
         and tc.table_schema = kcu.table_schema
        join information_schema.constraint_column_usage ccu
          on ccu.constraint_name = tc.constraint_name
         and ccu.table_schema = tc.table_schema
        where tc.constraint_type = 'FOREIGN KEY'
          and tc.table_schema = $1
          and tc.table_name = $2
        order by tc.constraint_name, kcu.ordinal_position
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await?;

    // Grouped by constraint name for a stable order.
    let mut fk_map: BTreeMap<String, ForeignKey> = BTreeMap::new();
    for fk in fk_rows {
        let constraint_name: String = fk.get("constraint_name");
        let entry = fk_map
            .entry(constraint_name.clone())
            .or_insert_with(|| ForeignKey {
                name: constraint_name,
                columns: Vec::new(),
                references: ForeignKeyTarget {
                    table: fk.get("foreign_table_name"),
                    columns: Vec::new(),
                },
            });
        let column: String = fk.get("column_name");
        let foreign_column: String = fk.get("foreign_column_name");
        if !entry.columns.contains(&column) {
            entry.columns.push(column);
        }
        if !entry.references.columns.contains(&foreign_column) {
            entry.references.columns.push(foreign_column);
        }
    }

    Ok(TableInfo {
        name: table.to_string(),
        columns,
        primary_key,
        foreign_keys: fk_map.into_values().collect(),
    })
}

/// Build entity definitions, relations and capabilities from catalog data.
pub fn derive_definition(tables: Vec<TableInfo>, options: &IntrospectOptions) -> SchemaDefinition {
    let mut entities: Vec<EntityDefinition> = tables
        .iter()
        .map(|table| EntityDefinition {
            name: table.name.clone(),
            connection: None,
            columns: table.columns.clone(),
            primary_key: table.primary_key.clone(),
            foreign_keys: table.foreign_keys.clone(),
            relations: Vec::new(),
            capabilities: capabilities(table, options),
        })
        .collect();

    for table in &tables {
        for fk in &table.foreign_keys {
            let ([column], [referenced]) = (fk.columns.as_slice(), fk.references.columns.as_slice())
            else {
                tracing::debug!(table = %table.name, fk = %fk.name, "skipping composite foreign key");
                continue;
            };
            let target = fk.references.table.as_str();
            if !tables.iter().any(|t| t.name == target) {
                continue;
            }

            let owner_name = column
                .strip_suffix("_id")
                .filter(|s| !s.is_empty())
                .unwrap_or(target)
                .to_string();
            push_relation(
                &mut entities,
                &table.name,
                RelationDefinition {
                    name: owner_name,
                    kind: RelationKind::BelongsTo,
                    related: target.to_string(),
                    local_key: Some(column.clone()),
                    foreign_key: Some(referenced.clone()),
                    pivot: None,
                },
            );
            push_relation(
                &mut entities,
                target,
                RelationDefinition {
                    name: table.name.clone(),
                    kind: RelationKind::HasMany,
                    related: table.name.clone(),
                    local_key: Some(referenced.clone()),
                    foreign_key: Some(column.clone()),
                    pivot: None,
                },
            );
        }
    }

    SchemaDefinition { entities }
}

fn push_relation(entities: &mut [EntityDefinition], entity: &str, relation: RelationDefinition) {
    let Some(def) = entities.iter_mut().find(|e| e.name == entity) else {
        return;
    };
    if def.relations.iter().any(|r| r.name == relation.name)
        || def.columns.iter().any(|c| c.name == relation.name)
    {
        tracing::debug!(entity, relation = %relation.name, "relation name taken, skipping");
        return;
    }
    def.relations.push(relation);
}

fn capabilities(table: &TableInfo, options: &IntrospectOptions) -> Capabilities {
    let has = |name: &str| table.columns.iter().any(|c| c.name == name);
    Capabilities {
        soft_deletes: has(&options.soft_delete_column).then(|| options.soft_delete_column.clone()),
        timestamps: (has(&options.timestamps.created_at) && has(&options.timestamps.updated_at))
            .then(|| options.timestamps.clone()),
        lockable: has(&options.version_column),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quarry_core::SchemaRegistry;

    fn table(name: &str, columns: &[&str], fks: &[(&str, &str)]) -> TableInfo {
        TableInfo {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|c| ColumnSchema::new(*c, "bigint"))
                .collect(),
            primary_key: vec!["id".to_string()],
            foreign_keys: fks
                .iter()
                .map(|(column, target)| ForeignKey {
                    name: format!("{name}_{column}_fkey"),
                    columns: vec![column.to_string()],
                    references: ForeignKeyTarget {
                        table: target.to_string(),
                        columns: vec!["id".to_string()],
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn test_foreign_keys_become_relation_pairs() {
        let options = IntrospectOptions::new(&LockingConfig::default());
        let definition = derive_definition(
            vec![
                table("customers", &["id", "name", "created_at", "updated_at"], &[]),
                table(
                    "orders",
                    &["id", "customer_id", "lock_version", "deleted_at"],
                    &[("customer_id", "customers")],
                ),
            ],
            &options,
        );

        let orders = definition.entities.iter().find(|e| e.name == "orders").unwrap();
        assert_eq!(orders.relations.len(), 1);
        assert_eq!(orders.relations[0].name, "customer");
        assert_eq!(orders.relations[0].kind, RelationKind::BelongsTo);
        assert!(orders.capabilities.lockable);
        assert_eq!(orders.capabilities.soft_deletes.as_deref(), Some("deleted_at"));

        let customers = definition.entities.iter().find(|e| e.name == "customers").unwrap();
        assert_eq!(customers.relations[0].name, "orders");
        assert_eq!(customers.relations[0].kind, RelationKind::HasMany);
        assert!(customers.capabilities.timestamps.is_some());
        assert!(!customers.capabilities.lockable);

        // The derived definition resolves and pairs up.
        let registry = SchemaRegistry::build(definition, "default").unwrap();
        let inverse = registry.inverse_of("orders", "customer").unwrap();
        assert_eq!(inverse.map(|r| r.name.as_str()), Some("orders"));
    }

    #[test]
    fn test_fk_to_unknown_table_is_ignored() {
        let options = IntrospectOptions::new(&LockingConfig::default());
        let definition = derive_definition(
            vec![table("orders", &["id", "region_id"], &[("region_id", "regions")])],
            &options,
        );
        assert!(definition.entities[0].relations.is_empty());
    }
}
