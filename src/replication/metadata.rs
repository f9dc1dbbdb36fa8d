// ABOUTME: MetadataStore - per-table sync cursors persisted in the target database
// ABOUTME: Cursor reads are backdated by a safety margin; writes share the sync transaction

use chrono::{Duration, NaiveDateTime};
use deadpool_postgres::Pool;
use serde::Serialize;
use tokio_postgres::error::SqlState;
use tokio_postgres::Transaction;

use crate::error::{Error, Result};
use crate::utils::{qualified_name, quote_ident};

/// Name of the cursor table on the target.
pub const METADATA_TABLE: &str = "sync_metadata";

/// How far every cursor read is moved back to cover commits that become
/// visible after their timestamp was assigned.
pub const CURSOR_SAFETY_MARGIN_MINUTES: i64 = 30;

/// Cursor assigned to a table that has never been synced.
pub fn epoch() -> NaiveDateTime {
    // NaiveDateTime's default is 1970-01-01 00:00:00
    NaiveDateTime::default()
}

/// Move a stored cursor back by the safety margin.
///
/// Applied on every read, so repeated syncs always re-scan the last half hour
/// of changes.
pub fn apply_safety_margin(stored: NaiveDateTime) -> NaiveDateTime {
    stored
        .checked_sub_signed(Duration::minutes(CURSOR_SAFETY_MARGIN_MINUTES))
        .unwrap_or(NaiveDateTime::MIN)
}

/// A stored cursor as it is in the table, without the margin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorEntry {
    pub table_name: String,
    pub last_sync_time: Option<NaiveDateTime>,
}

/// Reads and writes `sync_metadata` on the target database.
#[derive(Clone)]
pub struct MetadataStore {
    target: Pool,
    schema: String,
}

impl MetadataStore {
    pub fn new(target: Pool, schema: impl Into<String>) -> Self {
        Self {
            target,
            schema: schema.into(),
        }
    }

    fn table(&self) -> String {
        qualified_name(&self.schema, METADATA_TABLE)
    }

    /// Create the metadata schema and table if they are missing.
    ///
    /// Existing cursors are never touched.
    pub async fn ensure_metadata_table(&self) -> Result<()> {
        let client = self
            .target
            .get()
            .await
            .map_err(|e| Error::pool("Failed to acquire target connection", e))?;

        let ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS {};
             CREATE TABLE IF NOT EXISTS {} (
                 table_name TEXT PRIMARY KEY,
                 last_sync_time TIMESTAMP
             );",
            quote_ident(&self.schema),
            self.table()
        );
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| Error::database("Failed to create sync metadata table", e))?;

        tracing::debug!("Sync metadata table {} ready", self.table());
        Ok(())
    }

    /// Cursor to use for the next change window of `table`.
    ///
    /// Seeds the epoch row on first reference and returns the stored value
    /// minus the safety margin. When the metadata table itself is gone it is
    /// recreated and the epoch is returned as is.
    ///
    /// Runs on its own pooled connection, outside any sync transaction.
    pub async fn get_last_sync_time(&self, table: &str) -> Result<NaiveDateTime> {
        match self.read_cursor(table).await {
            Ok(stored) => Ok(apply_safety_margin(stored)),
            Err(e) if e.sql_state() == Some(&SqlState::UNDEFINED_TABLE) => {
                tracing::warn!("Sync metadata table is missing, recreating it");
                self.ensure_metadata_table().await?;
                self.seed(table).await?;
                Ok(epoch())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_cursor(&self, table: &str) -> Result<NaiveDateTime> {
        self.seed(table).await?;

        let client = self
            .target
            .get()
            .await
            .map_err(|e| Error::pool("Failed to acquire target connection", e))?;
        let row = client
            .query_one(
                &format!(
                    "SELECT last_sync_time FROM {} WHERE table_name = $1",
                    self.table()
                ),
                &[&table],
            )
            .await
            .map_err(|e| Error::database(format!("Failed to read cursor for '{}'", table), e))?;

        let stored: Option<NaiveDateTime> = row.get(0);
        Ok(stored.unwrap_or_else(epoch))
    }

    async fn seed(&self, table: &str) -> Result<()> {
        let client = self
            .target
            .get()
            .await
            .map_err(|e| Error::pool("Failed to acquire target connection", e))?;
        client
            .execute(
                &format!(
                    "INSERT INTO {} (table_name, last_sync_time) VALUES ($1, $2)
                     ON CONFLICT (table_name) DO NOTHING",
                    self.table()
                ),
                &[&table, &epoch()],
            )
            .await
            .map_err(|e| Error::database(format!("Failed to seed cursor for '{}'", table), e))?;
        Ok(())
    }

    /// Advance the cursor of `table` to the transaction's start time.
    ///
    /// Must run on the same transaction as the data it covers.
    pub async fn update_last_sync_time(&self, txn: &Transaction<'_>, table: &str) -> Result<()> {
        txn.execute(
            &format!(
                "INSERT INTO {} (table_name, last_sync_time) VALUES ($1, CURRENT_TIMESTAMP)
                 ON CONFLICT (table_name) DO UPDATE SET last_sync_time = EXCLUDED.last_sync_time",
                self.table()
            ),
            &[&table],
        )
        .await
        .map_err(|e| Error::database(format!("Failed to advance cursor for '{}'", table), e))?;
        Ok(())
    }

    /// All stored cursors, ordered by table name.
    pub async fn list(&self) -> Result<Vec<CursorEntry>> {
        let client = self
            .target
            .get()
            .await
            .map_err(|e| Error::pool("Failed to acquire target connection", e))?;
        let rows = client
            .query(
                &format!(
                    "SELECT table_name, last_sync_time FROM {} ORDER BY table_name",
                    self.table()
                ),
                &[],
            )
            .await
            .map_err(|e| Error::database("Failed to list sync cursors", e))?;

        Ok(rows
            .iter()
            .map(|row| CursorEntry {
                table_name: row.get(0),
                last_sync_time: row.get(1),
            })
            .collect())
    }
}
