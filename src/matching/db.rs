// src/matching/db.rs

use anyhow::{Context, Result};
use futures::pin_mut;
use log::info;
use postgres_types::{ToSql, Type};
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::Client;

use crate::config::DedupeConfig;
use crate::matching::manager::canonical_assignments;
use crate::models::Cluster;
use crate::utils::db_connect::PgPool;
use crate::utils::staging::{discard_on_error, StagedTable};

/// Writes `entity_map (_unique_id, canon_id, cluster_score)` for every
/// clustered record. Records outside any cluster are absent and default to
/// themselves when `map` is built.
pub async fn write_entity_map(pool: &PgPool, config: &DedupeConfig, clusters: &[Cluster]) -> Result<usize> {
    let target = StagedTable::new(&config.schema, "entity_map");
    let written = write_entity_map_inner(pool, &target, clusters).await;
    discard_on_error(pool, &[&target], written).await
}

async fn write_entity_map_inner(pool: &PgPool, target: &StagedTable, clusters: &[Cluster]) -> Result<usize> {
    let mut conn = pool.get().await.context("Failed to get DB connection for entity_map")?;
    target
        .create(
            &*conn,
            "_unique_id INTEGER PRIMARY KEY, canon_id INTEGER NOT NULL, cluster_score DOUBLE PRECISION NOT NULL",
        )
        .await?;
    let written = copy_assignments(&conn, target, clusters).await?;
    target.publish(&mut conn).await?;
    conn.batch_execute(&format!("CREATE INDEX ON {} (canon_id)", target.qualified()))
        .await
        .context("Failed to index entity_map")?;
    info!("💾 entity_map: {} clustered records in {} clusters", written, clusters.len());
    Ok(written)
}

async fn copy_assignments(client: &Client, target: &StagedTable, clusters: &[Cluster]) -> Result<usize> {
    let sink = client
        .copy_in(&format!(
            "COPY {} (_unique_id, canon_id, cluster_score) FROM STDIN BINARY",
            target.qualified_staging()
        ))
        .await
        .context("Failed to start COPY into entity_map")?;
    let copy = BinaryCopyInWriter::new(sink, &[Type::INT4, Type::INT4, Type::FLOAT8]);
    pin_mut!(copy);

    let assignments = canonical_assignments(clusters);
    for a in &assignments {
        let values: [&(dyn ToSql + Sync); 3] = [&a.record_id, &a.canon_id, &a.cluster_score];
        copy.as_mut()
            .write(&values)
            .await
            .context("Failed to write entity_map row")?;
    }
    copy.as_mut()
        .finish()
        .await
        .context("Failed to finish COPY into entity_map")?;
    Ok(assignments.len())
}
