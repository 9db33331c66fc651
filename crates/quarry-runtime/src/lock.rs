//! Optimistic Lock Guard.
//!
//! Lockable entities carry an integer version column that grows by exactly
//! one per successful write. Updates add `version = before` to their WHERE
//! clause; an UPDATE that affects no row means another writer got there
//! first and raises [`LockError::StaleLockingConflict`]. Conflicts are never
//! retried here.
//!
//! The same entities also support an ownership lock (`locked_at`,
//! `locked_user_id`). While held, writes by other principals fail with
//! [`LockError::LockedByOther`].

use chrono::Utc;
use quarry_core::{EntitySchema, LockingConfig, Principal};
use serde_json::Value;
use std::sync::Arc;

use crate::error::LockError;
use crate::record::{Record, Row};
use crate::store::{DeleteStatement, RowStore, UpdateStatement, VersionGuard};

// =============================================================================
// HOOKS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Continue,
    Veto,
}

/// Lifecycle callbacks around an update.
pub trait ModelHooks: Send + Sync {
    /// Runs before anything is written. Returning [`HookDecision::Veto`]
    /// aborts the update with no mutation.
    fn updating(&self, _entity: &EntitySchema, _record: &Record) -> HookDecision {
        HookDecision::Continue
    }

    /// Runs after a successful write, before change tracking is synced.
    fn updated(&self, _entity: &EntitySchema, _record: &Record) {}
}

pub struct NoHooks;

impl ModelHooks for NoHooks {}

// =============================================================================
// GUARD
// =============================================================================

/// Whether an update checks the version it started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    Optimistic,
    /// Still bumps the version, but does not require it to match.
    Unchecked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    Vetoed,
    /// Nothing to write on an unversioned entity.
    Unchanged,
}

#[derive(Clone)]
pub struct OptimisticLockGuard {
    store: Arc<dyn RowStore>,
    config: LockingConfig,
}

impl OptimisticLockGuard {
    pub fn new(store: Arc<dyn RowStore>, config: LockingConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockingConfig {
        &self.config
    }

    /// Insert a new record. Lockable entities start at version 1.
    pub async fn create(&self, entity: &EntitySchema, record: &mut Record) -> Result<(), LockError> {
        if entity.is_lockable() {
            record.set(self.config.version_column.as_str(), 1);
        }
        if let Some(ts) = entity.timestamps() {
            let now = now();
            record.set(ts.created_at.as_str(), now.clone());
            record.set(ts.updated_at.as_str(), now);
        }

        let stored = self.store.insert(entity, record.attributes()).await?;
        record.persisted(stored);
        Ok(())
    }

    pub async fn update(
        &self,
        entity: &EntitySchema,
        record: &mut Record,
        principal: &Principal,
        hooks: &dyn ModelHooks,
    ) -> Result<UpdateOutcome, LockError> {
        self.update_with(entity, record, principal, hooks, LockMode::Optimistic)
            .await
    }

    pub async fn update_with(
        &self,
        entity: &EntitySchema,
        record: &mut Record,
        principal: &Principal,
        hooks: &dyn ModelHooks,
        mode: LockMode,
    ) -> Result<UpdateOutcome, LockError> {
        let key = self.persisted_key(entity, record)?;
        self.check_holder(entity, record, principal)?;

        if hooks.updating(entity, record) == HookDecision::Veto {
            tracing::warn!(entity = %entity.name, "update vetoed by hook");
            return Ok(UpdateOutcome::Vetoed);
        }

        if record.is_dirty()
            && let Some(ts) = entity.timestamps()
        {
            record.set(ts.updated_at.as_str(), now());
        }

        let version_column = self.config.version_column.as_str();
        let before = record.version(version_column);
        let mut guard = None;
        if entity.is_lockable() {
            if mode == LockMode::Optimistic {
                guard = Some(VersionGuard {
                    column: version_column.to_string(),
                    expected: before,
                });
            }
            record.set_version(version_column, Some(before.unwrap_or(0) + 1));
        }

        let values = record.dirty();
        if values.is_empty() {
            return Ok(UpdateOutcome::Unchanged);
        }

        let statement = UpdateStatement {
            table: entity.name.clone(),
            key,
            values,
            guard,
        };
        let affected = match self.store.update(&statement).await {
            Ok(affected) => affected,
            Err(err) => {
                record.set_version(version_column, before);
                return Err(LockError::Store(err));
            }
        };

        if affected == 0 && entity.is_lockable() {
            record.set_version(version_column, before);
            let key = Value::Object(statement.key).to_string();
            tracing::warn!(
                entity = %entity.name,
                key = %key,
                expected = ?before,
                "stale lock version"
            );
            return Err(LockError::StaleLockingConflict {
                entity: entity.name.clone(),
                key,
                expected: before,
            });
        }
        if affected == 0 {
            return Err(LockError::NotPersisted {
                entity: entity.name.clone(),
            });
        }

        hooks.updated(entity, record);
        record.sync_original();
        Ok(UpdateOutcome::Updated)
    }

    /// Delete a record. Terminal: the record cannot be written again.
    pub async fn delete(
        &self,
        entity: &EntitySchema,
        record: &mut Record,
        principal: &Principal,
    ) -> Result<(), LockError> {
        let key = self.persisted_key(entity, record)?;
        self.check_holder(entity, record, principal)?;

        let version_column = self.config.version_column.as_str();
        let expected = record.version(version_column);
        let guard = entity.is_lockable().then(|| VersionGuard {
            column: version_column.to_string(),
            expected,
        });

        let statement = DeleteStatement {
            table: entity.name.clone(),
            key,
            guard,
        };
        let affected = self.store.delete(&statement).await?;
        if affected == 0 {
            return Err(if entity.is_lockable() {
                LockError::StaleLockingConflict {
                    entity: entity.name.clone(),
                    key: Value::Object(statement.key).to_string(),
                    expected,
                }
            } else {
                LockError::NotPersisted {
                    entity: entity.name.clone(),
                }
            });
        }

        record.mark_deleted();
        Ok(())
    }

    /// Take the ownership lock for `principal`. Re-acquiring a lock already
    /// held by the same principal refreshes its timestamp.
    pub async fn acquire(
        &self,
        entity: &EntitySchema,
        record: &mut Record,
        principal: &Principal,
    ) -> Result<(), LockError> {
        self.check_holder(entity, record, principal)?;
        record.set(self.config.locked_at_column.as_str(), now());
        record.set(
            self.config.locked_by_column.as_str(),
            principal.id.clone(),
        );
        self.update(entity, record, principal, &NoHooks).await?;
        Ok(())
    }

    /// Release the ownership lock held by `principal`.
    pub async fn release(
        &self,
        entity: &EntitySchema,
        record: &mut Record,
        principal: &Principal,
    ) -> Result<(), LockError> {
        if self.holder(record).is_none() {
            return Ok(());
        }
        self.check_holder(entity, record, principal)?;
        record.set(self.config.locked_at_column.as_str(), Value::Null);
        record.set(self.config.locked_by_column.as_str(), Value::Null);
        self.update(entity, record, principal, &NoHooks).await?;
        Ok(())
    }

    /// The principal holding the ownership lock, as last stored.
    pub fn holder(&self, record: &Record) -> Option<String> {
        match record.get(&self.config.locked_by_column)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn check_holder(
        &self,
        entity: &EntitySchema,
        record: &Record,
        principal: &Principal,
    ) -> Result<(), LockError> {
        match self.holder(record) {
            Some(holder) if holder != principal.id => Err(LockError::LockedByOther {
                entity: entity.name.clone(),
                holder,
            }),
            _ => Ok(()),
        }
    }

    fn persisted_key(&self, entity: &EntitySchema, record: &Record) -> Result<Row, LockError> {
        if !record.exists() {
            return Err(LockError::NotPersisted {
                entity: entity.name.clone(),
            });
        }
        record.key(entity).ok_or_else(|| LockError::NotPersisted {
            entity: entity.name.clone(),
        })
    }
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRowStore;
    use pretty_assertions::assert_eq;
    use quarry_core::{SchemaDefinition, SchemaRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SCHEMA: &str = r#"
entities:
  - name: invoices
    columns:
      - { name: id, data_type: bigint }
      - { name: total, data_type: numeric }
      - { name: lock_version, data_type: integer }
      - { name: locked_at, data_type: timestamptz }
      - { name: locked_user_id, data_type: text }
    primary_key: [id]
    lockable: true
    timestamps: {}
  - name: tags
    columns:
      - { name: id, data_type: bigint }
      - { name: label, data_type: text }
    primary_key: [id]
"#;

    struct Fixture {
        store: Arc<MemoryRowStore>,
        guard: OptimisticLockGuard,
        registry: Arc<SchemaRegistry>,
    }

    impl Fixture {
        fn entity(&self, name: &str) -> &EntitySchema {
            self.registry.entity(name).unwrap()
        }
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    async fn fixture() -> Fixture {
        let def = SchemaDefinition::from_yaml(SCHEMA).unwrap();
        let registry = Arc::new(SchemaRegistry::build(def, "default").unwrap());
        let store = Arc::new(MemoryRowStore::new(registry.clone()));
        store
            .seed(
                "invoices",
                vec![row(json!({ "id": 1, "total": 10, "lock_version": 5 }))],
            )
            .await;
        let guard = OptimisticLockGuard::new(store.clone(), LockingConfig::default());
        Fixture {
            store,
            guard,
            registry,
        }
    }

    fn loaded(version: i64) -> Record {
        Record::from_row(
            "invoices",
            row(json!({ "id": 1, "total": 10, "lock_version": version })),
        )
    }

    #[tokio::test]
    async fn test_update_bumps_version_by_one() {
        let fx = fixture().await;
        let mut record = loaded(5);
        record.set("total", 20);

        let outcome = fx
            .guard
            .update(fx.entity("invoices"), &mut record, &Principal::new("u1"), &NoHooks)
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Updated);
        assert_eq!(record.version("lock_version"), Some(6));
        assert!(!record.is_dirty());
        let stored = &fx.store.rows("invoices").await[0];
        assert_eq!(stored["lock_version"], json!(6));
        assert_eq!(stored["total"], json!(20));
        assert!(stored.contains_key("updated_at"));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected_and_rolled_back() {
        let fx = fixture().await;
        let mut record = loaded(4);
        record.set("total", 99);

        let err = fx
            .guard
            .update(fx.entity("invoices"), &mut record, &Principal::new("u1"), &NoHooks)
            .await
            .unwrap_err();

        assert!(err.is_stale());
        let LockError::StaleLockingConflict { entity, key, expected } = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(entity, "invoices");
        assert_eq!(key, r#"{"id":1}"#);
        assert_eq!(*expected, Some(4));
        assert_eq!(record.version("lock_version"), Some(4));
        assert_eq!(fx.store.rows("invoices").await[0]["total"], json!(10));
    }

    #[tokio::test]
    async fn test_concurrent_updates_exactly_one_wins() {
        let fx = fixture().await;
        let entity = fx.entity("invoices");
        let principal = Principal::new("u1");

        let mut first = loaded(5);
        first.set("total", 11);
        let mut second = loaded(5);
        second.set("total", 12);

        let (a, b) = tokio::join!(
            fx.guard.update(entity, &mut first, &principal, &NoHooks),
            fx.guard.update(entity, &mut second, &principal, &NoHooks),
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| r.as_ref().is_err_and(LockError::is_stale))
        );
        assert_eq!(fx.store.rows("invoices").await[0]["lock_version"], json!(6));
    }

    struct Veto;

    impl ModelHooks for Veto {
        fn updating(&self, _entity: &EntitySchema, _record: &Record) -> HookDecision {
            HookDecision::Veto
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl ModelHooks for Counting {
        fn updated(&self, _entity: &EntitySchema, _record: &Record) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_veto_leaves_record_and_row_untouched() {
        let fx = fixture().await;
        let mut record = loaded(5);
        record.set("total", 30);

        let outcome = fx
            .guard
            .update(fx.entity("invoices"), &mut record, &Principal::new("u1"), &Veto)
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Vetoed);
        assert_eq!(record.version("lock_version"), Some(5));
        assert_eq!(fx.store.rows("invoices").await[0]["lock_version"], json!(5));
    }

    #[tokio::test]
    async fn test_updated_hook_runs_once_on_success() {
        let fx = fixture().await;
        let hooks = Counting::default();
        let mut record = loaded(5);
        record.set("total", 31);

        fx.guard
            .update(fx.entity("invoices"), &mut record, &Principal::new("u1"), &hooks)
            .await
            .unwrap();
        assert_eq!(hooks.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unchecked_mode_skips_version_match() {
        let fx = fixture().await;
        let mut record = loaded(2);
        record.set("total", 40);

        fx.guard
            .update_with(
                fx.entity("invoices"),
                &mut record,
                &Principal::new("u1"),
                &NoHooks,
                LockMode::Unchecked,
            )
            .await
            .unwrap();
        assert_eq!(fx.store.rows("invoices").await[0]["lock_version"], json!(3));
    }

    #[tokio::test]
    async fn test_create_starts_at_version_one() {
        let fx = fixture().await;
        let mut record = Record::new("invoices");
        record.set("total", 7);

        fx.guard
            .create(fx.entity("invoices"), &mut record)
            .await
            .unwrap();

        assert!(record.exists());
        assert_eq!(record.version("lock_version"), Some(1));
        assert_eq!(record.get("id"), Some(&json!(2)));
        assert!(record.get("created_at").is_some());
    }

    #[tokio::test]
    async fn test_unversioned_entity_updates_without_guard() {
        let fx = fixture().await;
        let tags = fx.entity("tags");
        let mut record = Record::new("tags");
        record.set("label", "urgent");
        fx.guard.create(tags, &mut record).await.unwrap();
        assert!(record.get("lock_version").is_none());

        let principal = Principal::new("u1");
        let outcome = fx
            .guard
            .update(tags, &mut record, &principal, &NoHooks)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged);

        record.set("label", "later");
        let outcome = fx
            .guard
            .update(tags, &mut record, &principal, &NoHooks)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);
    }

    #[tokio::test]
    async fn test_delete_is_terminal() {
        let fx = fixture().await;
        let entity = fx.entity("invoices");
        let principal = Principal::new("u1");
        let mut record = loaded(5);

        fx.guard.delete(entity, &mut record, &principal).await.unwrap();
        assert!(!record.exists());
        assert!(fx.store.rows("invoices").await.is_empty());

        record.set("total", 1);
        let err = fx
            .guard
            .update(entity, &mut record, &principal, &NoHooks)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::NotPersisted { .. }));
    }

    #[tokio::test]
    async fn test_ownership_lock_blocks_other_principals() {
        let fx = fixture().await;
        let entity = fx.entity("invoices");
        let owner = Principal::new("owner");
        let other = Principal::new("other");

        let mut record = loaded(5);
        fx.guard.acquire(entity, &mut record, &owner).await.unwrap();
        assert_eq!(fx.guard.holder(&record).as_deref(), Some("owner"));
        assert_eq!(record.version("lock_version"), Some(6));

        let mut theirs = Record::from_row("invoices", fx.store.rows("invoices").await[0].clone());
        theirs.set("total", 50);
        let err = fx
            .guard
            .update(entity, &mut theirs, &other, &NoHooks)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::LockedByOther { ref holder, .. } if holder == "owner"));

        fx.guard.release(entity, &mut record, &owner).await.unwrap();
        assert_eq!(fx.guard.holder(&record), None);
    }
}
