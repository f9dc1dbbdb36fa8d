// ABOUTME: SchemaMirror - derives target table DDL from source catalog metadata
// ABOUTME: Creates the target schema, table and primary key constraint on first use

use deadpool_postgres::Pool;
use tokio_postgres::Transaction;

use crate::config::ResolvedTable;
use crate::error::{Error, Result};
use crate::utils::{qualified_name, quote_ident};

/// Column metadata read from the source `information_schema.columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: String,
    pub character_maximum_length: Option<i32>,
    pub numeric_precision: Option<i32>,
    pub numeric_scale: Option<i32>,
    pub is_nullable: bool,
    pub column_default: Option<String>,
}

/// Map a source `data_type` to the DDL type used on the target.
///
/// Pure function of `(data_type, length, precision, scale)`:
///
/// ```
/// # use table_replicator::replication::schema::map_data_type;
/// assert_eq!(map_data_type("character varying", Some(50), None, None), "varchar(50)");
/// assert_eq!(map_data_type("numeric", None, None, None), "numeric(19,2)");
/// assert_eq!(map_data_type("timestamp without time zone", None, None, None), "timestamp");
/// ```
pub fn map_data_type(
    data_type: &str,
    character_maximum_length: Option<i32>,
    numeric_precision: Option<i32>,
    numeric_scale: Option<i32>,
) -> String {
    match data_type {
        "character varying" => match character_maximum_length {
            Some(len) => format!("varchar({})", len),
            None => "text".to_string(),
        },
        "numeric" => match (numeric_precision, numeric_scale) {
            (Some(precision), Some(scale)) => format!("numeric({},{})", precision, scale),
            _ => "numeric(19,2)".to_string(),
        },
        "timestamp without time zone" => "timestamp".to_string(),
        "character" => match character_maximum_length {
            Some(len) => format!("char({})", len),
            None => "char(1)".to_string(),
        },
        other => other.to_string(),
    }
}

/// Render one column of a `CREATE TABLE` statement.
///
/// Sequence-backed defaults are dropped: the sequence only exists on the source
/// and values always arrive from there.
pub fn column_definition(column: &ColumnDefinition) -> String {
    let mut definition = format!(
        "{} {}",
        quote_ident(&column.name),
        map_data_type(
            &column.data_type,
            column.character_maximum_length,
            column.numeric_precision,
            column.numeric_scale,
        )
    );

    if !column.is_nullable {
        definition.push_str(" NOT NULL");
    }

    if let Some(default) = &column.column_default {
        if !default.contains("nextval(") {
            definition.push_str(" DEFAULT ");
            definition.push_str(default);
        }
    }

    definition
}

/// Build `CREATE TABLE IF NOT EXISTS` for the mirrored columns.
pub fn build_create_table_query(schema: &str, table: &str, columns: &[ColumnDefinition]) -> String {
    let definitions: Vec<String> = columns.iter().map(column_definition).collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_name(schema, table),
        definitions.join(", ")
    )
}

/// Name of the primary key constraint created on a target table.
pub fn primary_key_constraint_name(table: &str) -> String {
    format!("{}_pkey", table)
}

pub fn build_add_primary_key_query(schema: &str, table: &str, primary_key: &[String]) -> String {
    let columns: Vec<String> = primary_key.iter().map(|c| quote_ident(c)).collect();
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
        qualified_name(schema, table),
        quote_ident(&primary_key_constraint_name(table)),
        columns.join(", ")
    )
}

/// Creates target tables that mirror their source counterparts.
///
/// Catalog reads go to the source pool; DDL runs on the caller's transaction so
/// a failed sync also rolls back a freshly created table.
#[derive(Clone)]
pub struct SchemaMirror {
    source: Pool,
}

impl SchemaMirror {
    pub fn new(source: Pool) -> Self {
        Self { source }
    }

    /// Make sure the target table for `table` exists with its primary key.
    ///
    /// An existing target table is left as it is, even if the source has
    /// changed shape since it was created.
    pub async fn ensure_table(&self, txn: &Transaction<'_>, table: &ResolvedTable) -> Result<()> {
        let columns = self.source_columns(table).await?;

        txn.batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&table.target_schema)
        ))
        .await
        .map_err(|e| {
            Error::database(
                format!("Failed to create target schema '{}'", table.target_schema),
                e,
            )
        })?;

        let create = build_create_table_query(&table.target_schema, &table.target_table, &columns);
        txn.batch_execute(&create).await.map_err(|e| {
            Error::database(
                format!("Failed to create target table {}", table.target_qualified()),
                e,
            )
        })?;

        if !table.primary_key.is_empty() && !self.has_primary_key_constraint(txn, table).await? {
            tracing::info!(
                "Adding primary key ({}) to {}",
                table.primary_key.join(", "),
                table.target_qualified()
            );
            let alter = build_add_primary_key_query(
                &table.target_schema,
                &table.target_table,
                &table.primary_key,
            );
            txn.batch_execute(&alter).await.map_err(|e| {
                Error::database(
                    format!("Failed to add primary key to {}", table.target_qualified()),
                    e,
                )
            })?;
        }

        tracing::debug!(
            "Target table {} verified ({} columns)",
            table.target_qualified(),
            columns.len()
        );
        Ok(())
    }

    /// Read the source table's column metadata, failing on a missing schema,
    /// missing table or a table without columns.
    pub async fn source_columns(&self, table: &ResolvedTable) -> Result<Vec<ColumnDefinition>> {
        let client = self
            .source
            .get()
            .await
            .map_err(|e| Error::pool("Failed to acquire source connection", e))?;

        let schema_exists = client
            .query_opt(
                "SELECT 1 FROM information_schema.schemata WHERE schema_name = $1",
                &[&table.source_schema],
            )
            .await
            .map_err(|e| Error::database("Failed to check source schema", e))?
            .is_some();
        if !schema_exists {
            return Err(Error::Schema(format!(
                "Source schema '{}' does not exist",
                table.source_schema
            )));
        }

        let table_exists = client
            .query_opt(
                "SELECT 1 FROM information_schema.tables
                 WHERE table_schema = $1 AND table_name = $2",
                &[&table.source_schema, &table.source_table],
            )
            .await
            .map_err(|e| Error::database("Failed to check source table", e))?
            .is_some();
        if !table_exists {
            return Err(Error::Schema(format!(
                "Source table {} does not exist",
                table.source_qualified()
            )));
        }

        let rows = client
            .query(
                "SELECT column_name::text,
                        data_type::text,
                        character_maximum_length::int4,
                        numeric_precision::int4,
                        numeric_scale::int4,
                        is_nullable::text,
                        column_default::text
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&table.source_schema, &table.source_table],
            )
            .await
            .map_err(|e| {
                Error::database(
                    format!("Failed to read columns of {}", table.source_qualified()),
                    e,
                )
            })?;

        if rows.is_empty() {
            return Err(Error::Schema(format!(
                "Source table {} has no columns",
                table.source_qualified()
            )));
        }

        Ok(rows
            .iter()
            .map(|row| ColumnDefinition {
                name: row.get(0),
                data_type: row.get(1),
                character_maximum_length: row.get(2),
                numeric_precision: row.get(3),
                numeric_scale: row.get(4),
                is_nullable: row.get::<_, String>(5) == "YES",
                column_default: row.get(6),
            })
            .collect())
    }

    async fn has_primary_key_constraint(
        &self,
        txn: &Transaction<'_>,
        table: &ResolvedTable,
    ) -> Result<bool> {
        let row = txn
            .query_opt(
                "SELECT 1 FROM information_schema.table_constraints
                 WHERE table_schema = $1 AND table_name = $2 AND constraint_name = $3",
                &[
                    &table.target_schema,
                    &table.target_table,
                    &primary_key_constraint_name(&table.target_table),
                ],
            )
            .await
            .map_err(|e| Error::database("Failed to check primary key constraint", e))?;
        Ok(row.is_some())
    }
}
