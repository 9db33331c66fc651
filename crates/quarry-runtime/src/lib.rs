//! # quarry-runtime
//!
//! Write path and request orchestration for Quarry: change-tracked records,
//! the optimistic lock guard, storage contracts, an in-memory row store and
//! the [`CrudService`] that ties planning, ACL and locking together.

pub mod error;
pub mod lock;
pub mod memory;
pub mod record;
pub mod service;
pub mod store;

pub use error::{LockError, ServiceError};
pub use lock::{HookDecision, LockMode, ModelHooks, NoHooks, OptimisticLockGuard, UpdateOutcome};
pub use memory::MemoryRowStore;
pub use record::{Record, Row};
pub use service::{CrudService, UpdateResult};
pub use store::{
    DeleteStatement, QueryExecutor, QueryResult, RowStore, UpdateStatement, VersionGuard,
};
