// src/utils/staging.rs

//! Write-to-staging-then-rename for derived tables.
//!
//! A stage builds `<schema>.<name>_staging` and publishes it by dropping the
//! live table and renaming the staging table inside one transaction, so a
//! downstream stage sees either the complete table or none at all. On
//! failure or cancellation the staging table is dropped.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio_postgres::{Client, GenericClient, Transaction};

use crate::utils::db_connect::PgPool;

pub const STAGING_SUFFIX: &str = "_staging";

/// Every table a run derives, in creation order.
pub const DERIVED_TABLES: &[&str] = &[
    "entries_unique",
    "blocking_map",
    "plural_key",
    "plural_block",
    "covered_blocks",
    "smaller_coverage",
    "entity_map",
    "map",
    "unique_map",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTable {
    schema: String,
    name: String,
}

impl StagedTable {
    pub fn new(schema: &str, name: &str) -> Self {
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn staging_name(&self) -> String {
        format!("{}{}", self.name, STAGING_SUFFIX)
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn qualified_staging(&self) -> String {
        format!("{}.{}", self.schema, self.staging_name())
    }

    /// Recreates an empty staging table with the given column list.
    pub async fn create<C: GenericClient>(&self, client: &C, columns_ddl: &str) -> Result<()> {
        self.discard(client).await?;
        let sql = format!("CREATE TABLE {} ({})", self.qualified_staging(), columns_ddl);
        client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to create {}", self.qualified_staging()))?;
        debug!("Created staging table {}", self.qualified_staging());
        Ok(())
    }

    /// Recreates the staging table from a query.
    pub async fn create_as<C: GenericClient>(&self, client: &C, select_sql: &str) -> Result<()> {
        self.discard(client).await?;
        let sql = format!("CREATE TABLE {} AS ({})", self.qualified_staging(), select_sql);
        client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to create {}", self.qualified_staging()))?;
        debug!("Created staging table {} from query", self.qualified_staging());
        Ok(())
    }

    /// Atomically replaces the live table with the staging table.
    pub async fn publish(&self, client: &mut Client) -> Result<()> {
        let transaction = client
            .transaction()
            .await
            .context("Failed to start publish transaction")?;
        self.publish_in(&transaction).await?;
        transaction
            .commit()
            .await
            .with_context(|| format!("Failed to commit publish of {}", self.qualified()))?;
        info!("Published {}", self.qualified());
        Ok(())
    }

    /// Drop-and-rename inside a caller's transaction, so several tables can
    /// be published together.
    pub async fn publish_in(&self, transaction: &Transaction<'_>) -> Result<()> {
        transaction
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", self.qualified()))
            .await
            .with_context(|| format!("Failed to drop {}", self.qualified()))?;
        transaction
            .batch_execute(&format!(
                "ALTER TABLE {} RENAME TO {}",
                self.qualified_staging(),
                self.name
            ))
            .await
            .with_context(|| format!("Failed to rename {}", self.qualified_staging()))?;
        debug!("Renamed {} to {}", self.qualified_staging(), self.name);
        Ok(())
    }

    pub async fn discard<C: GenericClient>(&self, client: &C) -> Result<()> {
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", self.qualified_staging()))
            .await
            .with_context(|| format!("Failed to drop {}", self.qualified_staging()))?;
        Ok(())
    }
}

/// Drops the staging tables of a failed stage, then hands back the original
/// result. Cleanup failures are logged, never returned over the stage error.
pub async fn discard_on_error<T>(pool: &PgPool, tables: &[&StagedTable], result: Result<T>) -> Result<T> {
    if result.is_err() {
        match pool.get().await {
            Ok(conn) => {
                for table in tables {
                    if let Err(e) = table.discard(&*conn).await {
                        warn!("Could not drop {} after failure: {:#}", table.qualified_staging(), e);
                    }
                }
            }
            Err(e) => warn!("Could not get a connection to clean up staging tables: {}", e),
        }
    }
    result
}

/// Drops the staging table of every derived table in `schema`.
pub async fn discard_all_staging(pool: &PgPool, schema: &str) -> Result<usize> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for staging cleanup")?;
    let mut dropped = 0;
    for name in DERIVED_TABLES {
        StagedTable::new(schema, name).discard(&*conn).await?;
        dropped += 1;
    }
    let merged = conn
        .query(
            "SELECT tablename FROM pg_tables WHERE schemaname = $1 AND tablename LIKE 'merged\\_%\\_staging'",
            &[&schema],
        )
        .await
        .context("Failed to list exact-merge staging tables")?;
    for row in merged {
        let name: String = row.get("tablename");
        conn.batch_execute(&format!("DROP TABLE IF EXISTS {}.{}", schema, name))
            .await
            .with_context(|| format!("Failed to drop {}.{}", schema, name))?;
        dropped += 1;
    }
    info!("Dropped staging tables in schema {}", schema);
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_names() {
        let t = StagedTable::new("dedupe", "smaller_coverage");
        assert_eq!(t.qualified(), "dedupe.smaller_coverage");
        assert_eq!(t.staging_name(), "smaller_coverage_staging");
        assert_eq!(t.qualified_staging(), "dedupe.smaller_coverage_staging");
    }

    #[test]
    fn test_derived_tables_are_unique() {
        let mut names: Vec<&str> = DERIVED_TABLES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DERIVED_TABLES.len());
    }
}
