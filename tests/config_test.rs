// ABOUTME: Tests for loading replication config files from disk
// ABOUTME: Verifies defaults, table resolution and error context for bad files

use std::io::Write;
use table_replicator::SyncConfig;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
fn test_load_config_from_file() {
    let file = write_config(
        r#"
batch_size = 250
max_concurrent_tables = 2
default_source_schema = "adempiere"

[[tables]]
name = "customer_withdrawal"
primary_key = ["document_no", "s_sharetype_id"]
batch_size = 500
change_detection = { timestamp_column = "updated", track_deletes = true }

[[tables]]
name = "m_product"
source_name = "m_product_src"
target_schema = "mirror"
primary_key = "m_product_id"
change_detection = { timestamp_column = "updated" }
"#,
    );

    let config = SyncConfig::load(file.path()).expect("config should load");
    assert_eq!(config.table_names(), vec!["customer_withdrawal", "m_product"]);
    assert_eq!(config.max_concurrent_tables, 2);
    assert_eq!(config.retry_attempts, 3);

    let withdrawal = config.resolve("customer_withdrawal").unwrap();
    assert_eq!(withdrawal.batch_size, 500);
    assert_eq!(withdrawal.source_schema, "adempiere");
    assert_eq!(withdrawal.target_schema, "public");
    assert!(withdrawal.track_deletes);

    let product = config.resolve("m_product").unwrap();
    assert_eq!(product.batch_size, 250);
    assert_eq!(product.source_table, "m_product_src");
    assert_eq!(product.target_qualified(), "mirror.m_product");
    assert_eq!(product.primary_key, vec!["m_product_id".to_string()]);
    assert!(!product.track_deletes);
}

#[test]
fn test_load_missing_file_mentions_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = SyncConfig::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("absent.toml"));
}

#[test]
fn test_load_rejects_injection_in_identifiers() {
    let file = write_config(
        r#"
[[tables]]
name = "users; DROP TABLE users"
primary_key = "id"
change_detection = { timestamp_column = "updated_at" }
"#,
    );

    let err = SyncConfig::load(file.path()).unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("Invalid config file"));
}

#[test]
fn test_load_rejects_unknown_keys() {
    let file = write_config(
        r#"
batch_sise = 10

[[tables]]
name = "users"
primary_key = "id"
change_detection = { timestamp_column = "updated_at" }
"#,
    );

    assert!(SyncConfig::load(file.path()).is_err());
}
