// ABOUTME: Library root for table-replicator
// ABOUTME: Incremental timestamp-driven PostgreSQL table replication with reconciliation

pub mod config;
pub mod error;
pub mod postgres;
pub mod replication;
pub mod server;
pub mod utils;

pub use config::{ResolvedTable, SyncConfig, TableConfig};
pub use error::{Error, Result, SyncError};
pub use replication::{SyncOrchestrator, SyncProgress, SyncReport};
