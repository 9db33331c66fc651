//! # quarry-core
//!
//! Shared types for the Quarry CRUD engine:
//! - request value objects (columns, filter trees, sorts)
//! - principals and `{connection}.{table}.{operation}` permission names
//! - schema metadata and the relation registry
//! - configuration loading

pub mod config;
pub mod error;
pub mod principal;
pub mod request;
pub mod schema;

pub use config::{
    AclConfig, ConfigError, DatabaseConfig, LockingConfig, PlannerConfig, QuarryConfig,
};
pub use error::SchemaError;
pub use principal::{
    AllowAll, DenyAll, Operation, PermissionCheck, PermissionName, PermissionNameError, Principal,
};
pub use request::{
    Column, ColumnKind, ColumnRequest, Connective, Direction, Filter, FilterInput, FilterLeaf,
    FiltersGroup, Operator, QueryRequest, Sort,
};
pub use schema::{
    Capabilities, ColumnSchema, EntityDefinition, EntitySchema, ForeignKey, ForeignKeyTarget,
    PivotDescriptor, RelationDefinition, RelationDescriptor, RelationHop, RelationKind,
    SchemaDefinition, SchemaRegistry, TimestampColumns,
};
