// src/utils/sql.rs

use anyhow::{Context, Result};
use tokio_postgres::{GenericClient, Row};

use crate::models::Record;

/// Rows fetched per round trip from a server-side portal.
pub const FETCH_SIZE: i32 = 5_000;

/// `alias.col::text AS col, ...` for the comparison columns.
pub fn text_select_list(alias: Option<&str>, columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| match alias {
            Some(a) => format!("{}.{}::text AS {}", a, c, c),
            None => format!("{}::text AS {}", c, c),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `col1, col2, ...`, optionally qualified by `alias`.
pub fn column_list(alias: Option<&str>, columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| match alias {
            Some(a) => format!("{}.{}", a, c),
            None => c.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reads a [`Record`] whose id is at column `id_idx` and whose `n` text
/// values start at `first_value_idx`.
pub fn record_from_row(row: &Row, id_idx: usize, first_value_idx: usize, n: usize) -> Record {
    let values = (first_value_idx..first_value_idx + n)
        .map(|i| row.get::<_, Option<String>>(i))
        .collect();
    Record::new(row.get(id_idx), values)
}

pub async fn count_rows<C: GenericClient>(client: &C, table: &str) -> Result<i64> {
    let row = client
        .query_one(&format!("SELECT COUNT(*) FROM {}", table), &[])
        .await
        .with_context(|| format!("Failed to count rows of {}", table))?;
    Ok(row.get(0))
}
