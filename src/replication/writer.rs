// ABOUTME: Upserter - applies record batches to the target table inside a transaction
// ABOUTME: Uses INSERT ... ON CONFLICT DO UPDATE keyed on the primary key, plus keyed deletes

use tokio_postgres::types::ToSql;
use tokio_postgres::Transaction;

use super::record::{Record, Value};
use crate::config::ResolvedTable;
use crate::error::{Error, Result};
use crate::utils::quote_ident;

/// PostgreSQL's limit on bind parameters in one statement.
pub const MAX_BIND_PARAMETERS: usize = 65535;

/// Rows removed per DELETE statement.
pub const DELETE_CHUNK_SIZE: usize = 1000;

/// Writes batches into a target table.
///
/// Every statement runs on the caller's transaction; nothing is committed
/// here. Applying the same batch twice leaves the same rows as applying it
/// once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Upserter;

impl Upserter {
    pub fn new() -> Self {
        Self
    }

    /// Upsert `records` into the target table.
    ///
    /// The first record's columns are the insert column list. The batch is
    /// rejected before anything executes if any record differs from it or a
    /// primary key column is missing.
    ///
    /// # Returns
    ///
    /// The number of rows inserted or updated.
    pub async fn apply(
        &self,
        txn: &Transaction<'_>,
        table: &ResolvedTable,
        primary_keys: &[String],
        records: &[Record],
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let columns = validate_batch(records, primary_keys)?;
        let rows_per_statement = std::cmp::max(1, MAX_BIND_PARAMETERS / columns.len());

        let mut total_affected = 0u64;
        for chunk in records.chunks(rows_per_statement) {
            let query = build_upsert_query(
                &table.target_schema,
                &table.target_table,
                primary_keys,
                &columns,
                chunk.len(),
            );

            // Flatten all row values into a single params vector
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|record| record.values().map(|v| v as &(dyn ToSql + Sync)))
                .collect();

            let affected = txn.execute(&query, &params).await.map_err(|e| {
                Error::database(
                    format!("Failed to upsert batch into {}", table.target_qualified()),
                    e,
                )
            })?;
            total_affected += affected;
        }

        Ok(total_affected)
    }

    /// Delete rows by primary key tuple.
    ///
    /// Each inner vector holds one tuple in `primary_keys` order. Deletes run
    /// in chunks of [`DELETE_CHUNK_SIZE`].
    pub async fn delete_rows(
        &self,
        txn: &Transaction<'_>,
        table: &ResolvedTable,
        primary_keys: &[String],
        keys: &[Vec<Value>],
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut total_deleted = 0u64;
        for chunk in keys.chunks(DELETE_CHUNK_SIZE) {
            let query = build_delete_query(
                &table.target_schema,
                &table.target_table,
                primary_keys,
                chunk.len(),
            );

            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|key| key.iter().map(|v| v as &(dyn ToSql + Sync)))
                .collect();

            let deleted = txn.execute(&query, &params).await.map_err(|e| {
                Error::database(
                    format!("Failed to delete rows from {}", table.target_qualified()),
                    e,
                )
            })?;
            total_deleted += deleted;
        }

        Ok(total_deleted)
    }
}

/// Check that a batch can be written with one column list.
///
/// Returns that column list (the first record's columns, in order).
pub fn validate_batch(records: &[Record], primary_keys: &[String]) -> Result<Vec<String>> {
    let Some(first) = records.first() else {
        return Ok(Vec::new());
    };

    let columns: Vec<String> = first.columns().map(str::to_string).collect();
    if columns.is_empty() {
        return Err(Error::InvalidBatch("Record has no columns".to_string()));
    }

    for key in primary_keys {
        if !columns.contains(key) {
            return Err(Error::InvalidBatch(format!(
                "Primary key column '{}' is missing from the batch",
                key
            )));
        }
    }

    if let Some(position) = records.iter().position(|r| !r.has_columns(&columns)) {
        return Err(Error::InvalidBatch(format!(
            "Record {} has columns [{}], expected [{}]",
            position,
            records[position].columns().collect::<Vec<_>>().join(", "),
            columns.join(", ")
        )));
    }

    Ok(columns)
}

/// Build an upsert query for the given table schema and batch size.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "schema"."table" ("col1", "col2", "col3")
/// VALUES ($1, $2, $3), ($4, $5, $6), ...
/// ON CONFLICT ("pk_col") DO UPDATE SET
///   "col2" = EXCLUDED."col2",
///   "col3" = EXCLUDED."col3"
/// ```
pub fn build_upsert_query(
    schema: &str,
    table: &str,
    primary_key_columns: &[String],
    all_columns: &[String],
    num_rows: usize,
) -> String {
    let quoted_columns: Vec<String> = all_columns.iter().map(|c| quote_ident(c)).collect();
    let quoted_pk_columns: Vec<String> =
        primary_key_columns.iter().map(|c| quote_ident(c)).collect();

    // ($1, $2, $3), ($4, $5, $6), ...
    let num_cols = all_columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    // Key columns never appear in the SET list
    let update_columns: Vec<String> = all_columns
        .iter()
        .filter(|c| !primary_key_columns.contains(c))
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {}.{} ({}) VALUES {} ON CONFLICT ({}) {}",
        quote_ident(schema),
        quote_ident(table),
        quoted_columns.join(", "),
        value_rows.join(", "),
        quoted_pk_columns.join(", "),
        update_clause
    )
}

/// Build a delete query for multiple rows by primary key.
///
/// For single-column PK:
/// ```sql
/// DELETE FROM "schema"."table" WHERE "id" IN ($1, $2, $3, ...)
/// ```
///
/// For composite PK:
/// ```sql
/// DELETE FROM "schema"."table" WHERE ("pk1", "pk2") IN (($1, $2), ($3, $4), ...)
/// ```
pub fn build_delete_query(
    schema: &str,
    table: &str,
    primary_key_columns: &[String],
    num_rows: usize,
) -> String {
    let num_pk_cols = primary_key_columns.len();

    if num_pk_cols == 1 {
        let placeholders: Vec<String> = (1..=num_rows).map(|i| format!("${}", i)).collect();

        format!(
            "DELETE FROM {}.{} WHERE {} IN ({})",
            quote_ident(schema),
            quote_ident(table),
            quote_ident(&primary_key_columns[0]),
            placeholders.join(", ")
        )
    } else {
        let pk_cols: Vec<String> = primary_key_columns.iter().map(|c| quote_ident(c)).collect();

        let value_tuples: Vec<String> = (0..num_rows)
            .map(|row_idx| {
                let placeholders: Vec<String> = (0..num_pk_cols)
                    .map(|col_idx| format!("${}", row_idx * num_pk_cols + col_idx + 1))
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();

        format!(
            "DELETE FROM {}.{} WHERE ({}) IN ({})",
            quote_ident(schema),
            quote_ident(table),
            pk_cols.join(", "),
            value_tuples.join(", ")
        )
    }
}
