// ABOUTME: ChangeFeed - reads rows changed since a cursor from the source database
// ABOUTME: Counts the change window, pages through it by primary key, and scans keys

use chrono::NaiveDateTime;
use deadpool_postgres::Pool;

use super::record::{Record, Value};
use crate::config::ResolvedTable;
use crate::error::{Error, Result};
use crate::utils::quote_ident;

/// Reads the change window of a source table.
///
/// A row is in the window when its change-detection column is strictly greater
/// than the cursor. Every call takes its own pooled connection; nothing here is
/// transactional, so concurrent source writes between calls are visible.
///
/// Paging is by offset. Rows inserted or deleted in the source while a
/// multi-batch sync is running can shift pages, skipping or repeating rows
/// until the next cycle.
#[derive(Clone)]
pub struct ChangeFeed {
    source: Pool,
}

impl ChangeFeed {
    pub fn new(source: Pool) -> Self {
        Self { source }
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.source
            .get()
            .await
            .map_err(|e| Error::pool("Failed to acquire source connection", e))
    }

    /// Number of rows changed after `cursor`.
    pub async fn count(&self, table: &ResolvedTable, cursor: NaiveDateTime) -> Result<u64> {
        let client = self.client().await?;
        let row = client
            .query_one(&build_count_query(table), &[&cursor])
            .await
            .map_err(|e| {
                Error::database(
                    format!("Failed to count changes in {}", table.source_qualified()),
                    e,
                )
            })?;

        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    /// One page of changed rows, ordered by primary key.
    pub async fn fetch_batch(
        &self,
        table: &ResolvedTable,
        cursor: NaiveDateTime,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &build_fetch_query(table),
                &[&cursor, &(limit as i64), &(offset as i64)],
            )
            .await
            .map_err(|e| {
                Error::database(
                    format!(
                        "Failed to fetch batch at offset {} from {}",
                        offset,
                        table.source_qualified()
                    ),
                    e,
                )
            })?;

        rows.iter().map(Record::from_row).collect()
    }

    /// Every primary-key tuple currently in the source table.
    pub async fn scan_primary_keys(&self, table: &ResolvedTable) -> Result<Vec<Vec<Value>>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &build_key_scan_query(&table.source_sql_name(), &table.primary_key),
                &[],
            )
            .await
            .map_err(|e| {
                Error::database(
                    format!("Failed to scan primary keys of {}", table.source_qualified()),
                    e,
                )
            })?;

        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|idx| Value::from_row(row, idx))
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn build_count_query(table: &ResolvedTable) -> String {
    format!(
        "SELECT COUNT(*) FROM {} WHERE {} > $1::timestamp",
        table.source_sql_name(),
        quote_ident(&table.timestamp_column)
    )
}

pub fn build_fetch_query(table: &ResolvedTable) -> String {
    format!(
        "SELECT * FROM {} WHERE {} > $1::timestamp ORDER BY {} LIMIT $2 OFFSET $3",
        table.source_sql_name(),
        quote_ident(&table.timestamp_column),
        quoted_list(&table.primary_key)
    )
}

/// Select the key columns of an already-qualified table.
pub fn build_key_scan_query(qualified_table: &str, primary_key: &[String]) -> String {
    format!("SELECT {} FROM {}", quoted_list(primary_key), qualified_table)
}
