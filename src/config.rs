// ABOUTME: Replication configuration loaded from a TOML file
// ABOUTME: Defines table definitions, global defaults and identifier validation

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::utils::{qualified_name, validate_postgres_identifier};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_SCHEMA: &str = "public";

/// Top-level replication configuration.
///
/// Read once at process start and treated as immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Rows per batch for tables that don't set their own
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retries after the first attempt, for transient database failures only
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Per-statement timeout applied inside each table's sync transaction
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    /// Upper bound on tables syncing at the same time
    #[serde(default = "default_max_concurrent_tables")]
    pub max_concurrent_tables: usize,
    /// Schema holding the sync_metadata table on the target
    #[serde(default = "default_schema")]
    pub metadata_schema: String,
    #[serde(default = "default_schema")]
    pub default_source_schema: String,
    #[serde(default = "default_schema")]
    pub default_target_schema: String,
    /// Connection pool sizing, shared by the source and target pools
    #[serde(default)]
    pub pool: PoolSettings,
    pub tables: Vec<TableConfig>,
}

/// Connection pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    /// How long to wait for a new connection to be established
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// How long a caller may wait for a free pooled connection
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

/// Configuration for one replicated table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    /// Target table name, also the table's identity in the API and metadata
    pub name: String,
    /// Source table name, when it differs from `name`
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub source_schema: Option<String>,
    #[serde(default)]
    pub target_schema: Option<String>,
    pub primary_key: PrimaryKey,
    #[serde(default)]
    pub batch_size: Option<usize>,
    pub change_detection: ChangeDetection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeDetection {
    /// Column whose value increases on every mutation of a row
    pub timestamp_column: String,
    /// Remove target rows whose key no longer exists in the source
    #[serde(default)]
    pub track_deletes: bool,
}

/// Primary key columns; a bare string is accepted for single-column keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKey {
    pub fn columns(&self) -> Vec<String> {
        match self {
            PrimaryKey::Single(column) => vec![column.clone()],
            PrimaryKey::Composite(columns) => columns.clone(),
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_statement_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent_tables() -> usize {
    4
}

fn default_pool_max_size() -> usize {
    20
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_wait_timeout_secs() -> u64 {
    60
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

/// A table definition with every default applied.
///
/// This is what the replication components work with; they never look at
/// `TableConfig` optionals directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTable {
    pub name: String,
    pub source_schema: String,
    pub source_table: String,
    pub target_schema: String,
    pub target_table: String,
    pub primary_key: Vec<String>,
    pub batch_size: usize,
    pub timestamp_column: String,
    pub track_deletes: bool,
}

impl ResolvedTable {
    pub fn source_qualified(&self) -> String {
        format!("{}.{}", self.source_schema, self.source_table)
    }

    pub fn target_qualified(&self) -> String {
        format!("{}.{}", self.target_schema, self.target_table)
    }

    /// Quoted `"schema"."table"` of the source, for use in SQL text.
    pub fn source_sql_name(&self) -> String {
        qualified_name(&self.source_schema, &self.source_table)
    }

    /// Quoted `"schema"."table"` of the target, for use in SQL text.
    pub fn target_sql_name(&self) -> String {
        qualified_name(&self.target_schema, &self.target_table)
    }
}

impl SyncConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file {:?}", path))
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(contents).context("Failed to parse replication config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde can't express.
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            bail!("At least one [[tables]] entry is required");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be a positive integer");
        }
        if self.max_concurrent_tables == 0 {
            bail!("max_concurrent_tables must be a positive integer");
        }
        // Every running sync holds a target connection; the API needs one more
        if self.pool.max_size <= self.max_concurrent_tables {
            bail!(
                "pool.max_size ({}) must be greater than max_concurrent_tables ({})",
                self.pool.max_size,
                self.max_concurrent_tables
            );
        }

        for schema in [
            &self.metadata_schema,
            &self.default_source_schema,
            &self.default_target_schema,
        ] {
            validate_postgres_identifier(schema).context("Invalid schema name in config")?;
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                bail!("Table '{}' is configured more than once", table.name);
            }
            table
                .validate()
                .with_context(|| format!("Invalid configuration for table '{}'", table.name))?;
        }

        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Table names in configuration order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Resolve a configured table, applying global defaults.
    pub fn resolve(&self, name: &str) -> Option<ResolvedTable> {
        let table = self.table(name)?;
        Some(ResolvedTable {
            name: table.name.clone(),
            source_schema: table
                .source_schema
                .clone()
                .unwrap_or_else(|| self.default_source_schema.clone()),
            source_table: table
                .source_name
                .clone()
                .unwrap_or_else(|| table.name.clone()),
            target_schema: table
                .target_schema
                .clone()
                .unwrap_or_else(|| self.default_target_schema.clone()),
            target_table: table.name.clone(),
            primary_key: table.primary_key.columns(),
            batch_size: table.batch_size.unwrap_or(self.batch_size),
            timestamp_column: table.change_detection.timestamp_column.clone(),
            track_deletes: table.change_detection.track_deletes,
        })
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

impl TableConfig {
    fn validate(&self) -> Result<()> {
        validate_postgres_identifier(&self.name)?;
        for ident in [&self.source_name, &self.source_schema, &self.target_schema]
            .into_iter()
            .flatten()
        {
            validate_postgres_identifier(ident)?;
        }
        validate_postgres_identifier(&self.change_detection.timestamp_column)
            .context("Invalid change_detection.timestamp_column")?;

        let pk = self.primary_key.columns();
        if pk.is_empty() {
            bail!("primary_key must name at least one column");
        }
        let mut seen = HashSet::new();
        for column in &pk {
            validate_postgres_identifier(column).context("Invalid primary_key column")?;
            if !seen.insert(column.as_str()) {
                bail!("primary_key column '{}' is listed twice", column);
            }
        }

        if self.batch_size == Some(0) {
            bail!("batch_size must be a positive integer");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        batch_size = 1000

        [[tables]]
        name = "customer_withdrawal"
        primary_key = ["document_no", "s_sharetype_id"]
        batch_size = 500
        change_detection = { timestamp_column = "updated_at", track_deletes = true }

        [[tables]]
        name = "m_product"
        source_name = "m_product_src"
        source_schema = "adempiere"
        target_schema = "mirror"
        primary_key = "m_product_id"
        change_detection = { timestamp_column = "updated" }
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = SyncConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay(), Duration::from_millis(5000));
        assert_eq!(config.statement_timeout(), Duration::from_secs(300));
        assert_eq!(config.metadata_schema, "public");
        assert_eq!(config.pool.max_size, 20);
        assert_eq!(
            config.table_names(),
            vec!["customer_withdrawal".to_string(), "m_product".to_string()]
        );
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let config = SyncConfig::from_toml(SAMPLE).unwrap();

        let withdrawal = config.resolve("customer_withdrawal").unwrap();
        assert_eq!(withdrawal.source_schema, "public");
        assert_eq!(withdrawal.source_table, "customer_withdrawal");
        assert_eq!(withdrawal.target_schema, "public");
        assert_eq!(withdrawal.primary_key, vec!["document_no", "s_sharetype_id"]);
        assert_eq!(withdrawal.batch_size, 500);
        assert!(withdrawal.track_deletes);

        let product = config.resolve("m_product").unwrap();
        assert_eq!(product.source_qualified(), "adempiere.m_product_src");
        assert_eq!(product.target_qualified(), "mirror.m_product");
        assert_eq!(product.source_sql_name(), "\"adempiere\".\"m_product_src\"");
        assert_eq!(product.primary_key, vec!["m_product_id"]);
        assert_eq!(product.batch_size, 1000);
        assert!(!product.track_deletes);

        assert!(config.resolve("unknown").is_none());
    }

    #[test]
    fn test_rejects_invalid_identifiers() {
        let bad = r#"
            [[tables]]
            name = "orders; DROP TABLE x"
            primary_key = "id"
            change_detection = { timestamp_column = "updated_at" }
        "#;
        assert!(SyncConfig::from_toml(bad).is_err());

        let bad_column = r#"
            [[tables]]
            name = "orders"
            primary_key = ["id", "bad-col"]
            change_detection = { timestamp_column = "updated_at" }
        "#;
        assert!(SyncConfig::from_toml(bad_column).is_err());
    }

    #[test]
    fn test_rejects_empty_primary_key_and_zero_batch() {
        let empty_pk = r#"
            [[tables]]
            name = "orders"
            primary_key = []
            change_detection = { timestamp_column = "updated_at" }
        "#;
        assert!(SyncConfig::from_toml(empty_pk).is_err());

        let zero_batch = r#"
            [[tables]]
            name = "orders"
            primary_key = "id"
            batch_size = 0
            change_detection = { timestamp_column = "updated_at" }
        "#;
        assert!(SyncConfig::from_toml(zero_batch).is_err());
    }

    #[test]
    fn test_rejects_duplicate_tables_and_empty_list() {
        let duplicate = r#"
            [[tables]]
            name = "orders"
            primary_key = "id"
            change_detection = { timestamp_column = "updated_at" }

            [[tables]]
            name = "orders"
            primary_key = "id"
            change_detection = { timestamp_column = "updated_at" }
        "#;
        assert!(SyncConfig::from_toml(duplicate).is_err());

        assert!(SyncConfig::from_toml("tables = []").is_err());
    }

    #[test]
    fn test_rejects_pool_not_larger_than_concurrency() {
        let tables = r#"
            [[tables]]
            name = "orders"
            primary_key = "id"
            change_detection = { timestamp_column = "updated_at" }
        "#;

        let equal = format!("max_concurrent_tables = 2\n[pool]\nmax_size = 2\n{}", tables);
        let err = SyncConfig::from_toml(&equal).unwrap_err();
        assert!(err.to_string().contains("pool.max_size"));

        let larger = format!("max_concurrent_tables = 2\n[pool]\nmax_size = 3\n{}", tables);
        assert!(SyncConfig::from_toml(&larger).is_ok());
    }
}
