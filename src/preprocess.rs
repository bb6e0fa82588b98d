// src/preprocess.rs

use anyhow::{Context, Result};

use crate::config::DedupeConfig;
use crate::utils::db_connect::PgPool;
use crate::utils::logging::{PipelineStage, StageLogger};
use crate::utils::sql::{column_list, count_rows};
use crate::utils::staging::{discard_on_error, StagedTable};

pub fn entries_unique_select(config: &DedupeConfig) -> String {
    let cols = column_list(None, &config.columns());
    format!(
        "SELECT {cols}, array_agg({key} ORDER BY {key}) AS src_ids FROM {table} \
         WHERE ({filter}) GROUP BY {cols} ORDER BY {cols}",
        cols = cols,
        key = config.key,
        table = config.table,
        filter = config.filter_condition,
    )
}

/// Rebuilds `entries_unique`. Returns its row count.
pub async fn preprocess(pool: &PgPool, config: &DedupeConfig) -> Result<i64> {
    let logger = StageLogger::new(PipelineStage::Preprocess);
    let target = StagedTable::new(&config.schema, "entries_unique");

    let built = async {
        let mut conn = pool.get().await.context("Failed to get DB connection for preprocessing")?;
        conn.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", config.schema))
            .await
            .with_context(|| format!("Failed to create schema {}", config.schema))?;

        logger.log_phase("collapsing exact duplicates", Some(&config.table));
        target.create_as(&*conn, &entries_unique_select(config)).await?;
        conn.batch_execute(&format!(
            "ALTER TABLE {} ADD COLUMN _unique_id SERIAL PRIMARY KEY",
            target.qualified_staging()
        ))
        .await
        .context("Failed to add _unique_id to entries_unique")?;
        target.publish(&mut conn).await?;
        count_rows(&*conn, &target.qualified()).await
    }
    .await;
    let rows = discard_on_error(pool, &[&target], built).await?;

    logger.log_completion(&format!("{} unique records in {}", rows, target.qualified()));
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_unique_select() {
        let config = DedupeConfig::from_json_str(
            &serde_json::json!({
                "schema": "dedupe",
                "table": "dedupe.entries",
                "key": "entry_id",
                "fields": [
                    {"field": "first_name", "type": "String"},
                    {"field": "dob", "type": "Date"}
                ],
                "filter_condition": "dob IS NOT NULL"
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(
            entries_unique_select(&config),
            "SELECT first_name, dob, array_agg(entry_id ORDER BY entry_id) AS src_ids FROM dedupe.entries \
             WHERE (dob IS NOT NULL) GROUP BY first_name, dob ORDER BY first_name, dob"
        );
    }
}
