//! CRUD orchestration.
//!
//! Every operation follows the same pipeline: establish the principal,
//! authorize `{connection}.{table}.{operation}`, resolve the ACL constraint
//! for that permission and inject it around whatever the caller asked for.
//! Writes load the target through the same ACL-scoped lookup, so a row the
//! principal cannot see cannot be changed either.

use quarry_core::{EntitySchema, Operation, PermissionName, Principal, QueryRequest};
use quarry_planner::{FilterCompiler, Planner};
use quarry_policy::{
    AclResolver, Grants, PrincipalResolver, RequestContext, constrain_request, scope_query,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::lock::{ModelHooks, NoHooks, OptimisticLockGuard, UpdateOutcome};
use crate::record::{Record, Row};
use crate::store::{QueryExecutor, QueryResult};

/// Result of [`CrudService::update`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateResult {
    #[serde(skip)]
    pub outcome: UpdateOutcome,
    pub row: Row,
}

pub struct CrudService {
    planner: Planner,
    acl: Arc<AclResolver>,
    principals: Arc<PrincipalResolver>,
    executor: Arc<dyn QueryExecutor>,
    guard: OptimisticLockGuard,
    hooks: Arc<dyn ModelHooks>,
}

impl CrudService {
    pub fn new(
        planner: Planner,
        acl: Arc<AclResolver>,
        principals: Arc<PrincipalResolver>,
        executor: Arc<dyn QueryExecutor>,
        guard: OptimisticLockGuard,
    ) -> Self {
        Self {
            planner,
            acl,
            principals,
            executor,
            guard,
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ModelHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn acl(&self) -> &AclResolver {
        &self.acl
    }

    /// Request context for `principal`, falling back to the anonymous user.
    pub async fn context(&self, principal: Option<Principal>) -> Result<RequestContext, ServiceError> {
        Ok(self.principals.establish(principal).await?)
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        entity: &str,
        request: QueryRequest,
    ) -> Result<QueryResult, ServiceError> {
        let schema = self.planner.registry().entity(entity)?;
        let (grants, permission) = self.authorize(ctx, schema, Operation::List).await?;

        let constraint = self
            .acl
            .resolve_acl_filters(&permission, ctx.principal())
            .await?;
        let request = constrain_request(request, constraint.as_ref());
        let query = self.planner.plan(entity, &request, &grants)?;

        let result = self.executor.fetch(&query).await?;
        tracing::debug!(entity, rows = result.rows.len(), "listed");
        Ok(result)
    }

    pub async fn show(
        &self,
        ctx: &RequestContext,
        entity: &str,
        key: &Value,
        request: &QueryRequest,
    ) -> Result<Row, ServiceError> {
        let schema = self.planner.registry().entity(entity)?;
        let (grants, permission) = self.authorize(ctx, schema, Operation::Show).await?;
        self.find_scoped(ctx, schema, key, request, &grants, &permission)
            .await
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        entity: &str,
        attributes: Row,
    ) -> Result<Row, ServiceError> {
        let schema = self.planner.registry().entity(entity)?;
        self.authorize(ctx, schema, Operation::Create).await?;

        let mut record = Record::new(entity);
        record.fill(self.writable(schema, attributes));
        self.guard.create(schema, &mut record).await?;

        tracing::info!(entity, principal = %ctx.principal().id, "created");
        Ok(record.into_attributes())
    }

    /// Update the row at `key`.
    ///
    /// `expected_version` is the lock version the caller last read. When
    /// omitted the version currently stored is used, which still detects
    /// writers racing between this load and the write.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        entity: &str,
        key: &Value,
        attributes: Row,
        expected_version: Option<i64>,
    ) -> Result<UpdateResult, ServiceError> {
        let schema = self.planner.registry().entity(entity)?;
        let mut record = self
            .load_for_write(ctx, schema, key, Operation::Update, expected_version)
            .await?;

        record.fill(self.writable(schema, attributes));
        let outcome = self
            .guard
            .update(schema, &mut record, ctx.principal(), self.hooks.as_ref())
            .await?;

        tracing::info!(entity, principal = %ctx.principal().id, ?outcome, "updated");
        Ok(UpdateResult {
            outcome,
            row: record.into_attributes(),
        })
    }

    pub async fn delete(
        &self,
        ctx: &RequestContext,
        entity: &str,
        key: &Value,
        expected_version: Option<i64>,
    ) -> Result<(), ServiceError> {
        let schema = self.planner.registry().entity(entity)?;
        let mut record = self
            .load_for_write(ctx, schema, key, Operation::Delete, expected_version)
            .await?;

        self.guard
            .delete(schema, &mut record, ctx.principal())
            .await?;
        tracing::info!(entity, principal = %ctx.principal().id, "deleted");
        Ok(())
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn authorize(
        &self,
        ctx: &RequestContext,
        schema: &EntitySchema,
        operation: Operation,
    ) -> Result<(Grants, PermissionName), ServiceError> {
        let permission = PermissionName::new(&schema.connection, &schema.name, operation);
        let grants = self.acl.authorize(&permission, ctx.principal()).await?;
        Ok((grants, permission))
    }

    async fn find_scoped(
        &self,
        ctx: &RequestContext,
        schema: &EntitySchema,
        key: &Value,
        request: &QueryRequest,
        grants: &Grants,
        permission: &PermissionName,
    ) -> Result<Row, ServiceError> {
        let mut query = self
            .planner
            .plan_detail(&schema.name, key, request, grants)?;

        let constraint = self
            .acl
            .resolve_acl_filters(permission, ctx.principal())
            .await?;
        {
            let compiler = FilterCompiler::new(self.planner.registry(), grants);
            scope_query(
                &mut query,
                constraint.as_ref().map(|c| &c.filters),
                &compiler,
            )?;
        }

        let result = self.executor.fetch(&query).await?;
        result
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::NotFound {
                entity: schema.name.clone(),
                key: key.to_string(),
            })
    }

    async fn load_for_write(
        &self,
        ctx: &RequestContext,
        schema: &EntitySchema,
        key: &Value,
        operation: Operation,
        expected_version: Option<i64>,
    ) -> Result<Record, ServiceError> {
        let (grants, permission) = self.authorize(ctx, schema, operation).await?;
        let row = self
            .find_scoped(
                ctx,
                schema,
                key,
                &QueryRequest::default(),
                &grants,
                &permission,
            )
            .await?;

        let mut record = Record::from_row(&schema.name, row);
        if schema.is_lockable()
            && let Some(version) = expected_version
        {
            record.set_version(&self.guard.config().version_column, Some(version));
        }
        Ok(record)
    }

    /// Caller attributes minus the columns the lock guard owns.
    fn writable(&self, schema: &EntitySchema, mut attributes: Row) -> Row {
        if schema.is_lockable() {
            let locking = self.guard.config();
            attributes.remove(&locking.version_column);
            attributes.remove(&locking.locked_at_column);
            attributes.remove(&locking.locked_by_column);
        }
        attributes
    }
}
