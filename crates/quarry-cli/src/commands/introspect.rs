//! `quarry introspect` command implementation.

use anyhow::{Context, Result};
use quarry_adapter_pg::introspect::{IntrospectOptions, introspect};
use quarry_core::LockingConfig;
use sqlx::postgres::PgPoolOptions;

pub async fn run(database_url: &str, schema: &str, locking: &LockingConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
        .context("connecting to database")?;

    let options = IntrospectOptions {
        schema: schema.to_string(),
        ..IntrospectOptions::new(locking)
    };
    let definition = introspect(&pool, &options).await?;
    tracing::info!(entities = definition.entities.len(), "introspection complete");

    print!("{}", serde_yaml::to_string(&definition)?);
    Ok(())
}
