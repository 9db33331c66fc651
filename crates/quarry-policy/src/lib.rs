//! # quarry-policy
//!
//! Permission checks and row-level ACL for Quarry.
//!
//! A permission is named `{connection}.{table}.{operation}`. Principals hold
//! permissions directly or through groups; ACL rules attach a filter tree
//! (and optional sort) to a permission for a principal or group. Resolved
//! ACL filters are always injected as the outer AND around caller filters.

pub mod acl;
pub mod cache;
pub mod context;
pub mod error;
pub mod store;

pub use acl::{
    AclConstraint, AclResolver, Grants, constrain_request, inject_acl_filters, scope_query,
};
pub use cache::TtlCache;
pub use context::{PrincipalResolver, RequestContext};
pub use error::AclError;
pub use store::{
    AclRule, Grant, MemoryPermissionStore, Permission, PermissionData, PermissionStore, Scope,
};
