//! `quarry plan` command implementation.
//!
//! Plans a list request offline and prints the SQL the Postgres adapter
//! would run. With a permissions file, the request is authorized and
//! narrowed by the principal's ACL first.

use anyhow::{Context, Result};
use quarry_adapter_pg::sql::{SqlRenderer, Statement};
use quarry_core::{AllowAll, Operation, PermissionName, Principal, QuarryConfig, QueryRequest};
use quarry_planner::{Planner, Query};
use quarry_policy::{
    AclResolver, MemoryPermissionStore, PermissionStore, PrincipalResolver, constrain_request,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct PlanArgs {
    pub config: PathBuf,
    pub entity: String,
    /// Request JSON, or `@path` to read it from a file.
    pub request: Option<String>,
    pub principal: Option<String>,
    pub permissions: Option<PathBuf>,
}

/// Everything `plan` prints.
#[derive(Debug)]
pub struct PlanOutput {
    pub query: Query,
    pub select: Statement,
    pub totals: Option<Statement>,
}

pub async fn run(args: PlanArgs) -> Result<()> {
    let output = plan(&args).await?;
    print_statement("select", &output.select);
    if let Some(totals) = &output.totals {
        print_statement("totals", totals);
    }
    for path in output.query.eager_paths() {
        println!("-- eager: {path}");
    }
    Ok(())
}

pub async fn plan(args: &PlanArgs) -> Result<PlanOutput> {
    let config = QuarryConfig::load_with_context(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let registry = Arc::new(config.build_registry()?);
    let planner = Planner::new(Arc::clone(&registry), config.planner.clone());

    let request = match &args.request {
        Some(raw) => parse_request(raw)?,
        None => QueryRequest::default(),
    };

    let query = match &args.permissions {
        Some(path) => {
            let store = Arc::new(MemoryPermissionStore::from_file(path)?);
            let acl = AclResolver::new(store.clone(), &config.acl);
            let principals = PrincipalResolver::new(store.clone(), &config.acl);

            let principal = match &args.principal {
                Some(name) => Some(
                    store
                        .find_principal(name)
                        .await?
                        .unwrap_or_else(|| Principal::new(name.as_str())),
                ),
                None => None,
            };
            let ctx = principals.establish(principal).await?;

            let schema = registry.entity(&args.entity)?;
            let permission =
                PermissionName::new(&schema.connection, &schema.name, Operation::List);
            let grants = acl.authorize(&permission, ctx.principal()).await?;
            let constraint = acl.resolve_acl_filters(&permission, ctx.principal()).await?;
            let request = constrain_request(request, constraint.as_ref());
            planner.plan(&args.entity, &request, &grants)?
        }
        None => {
            tracing::debug!("no permissions file, planning unrestricted");
            planner.plan(&args.entity, &request, &AllowAll)?
        }
    };

    let select = SqlRenderer::new(&registry).select(&query)?;
    let totals = SqlRenderer::new(&registry).totals(&query)?;
    Ok(PlanOutput {
        query,
        select,
        totals,
    })
}

fn parse_request(raw: &str) -> Result<QueryRequest> {
    let content = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("reading request file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&content).context("parsing request JSON")
}

fn print_statement(label: &str, statement: &Statement) {
    println!("-- {label}");
    println!("{};", statement.sql);
    for (i, param) in statement.params.iter().enumerate() {
        println!("--   ${} = {}", i + 1, param.value);
    }
}
