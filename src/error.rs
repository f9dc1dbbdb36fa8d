// ABOUTME: Error taxonomy for the replication engine
// ABOUTME: Classifies config, schema, database and batch failures and decides what is retryable

use thiserror::Error;
use tokio_postgres::error::SqlState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures raised by the replication engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A referenced table is absent from the configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The source schema or table is missing, or has no introspectable columns.
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Database error: {context}: {source}")]
    Database {
        context: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("Connection pool error: {context}: {source}")]
    Pool {
        context: String,
        #[source]
        source: deadpool_postgres::PoolError,
    },

    /// A batch whose records do not share one column set, or lack key columns.
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Unsupported type '{type_name}' for column '{column}'")]
    UnsupportedType { column: String, type_name: String },

    #[error("Sync cancelled")]
    Cancelled,
}

impl Error {
    pub fn database(context: impl Into<String>, source: tokio_postgres::Error) -> Self {
        Error::Database {
            context: context.into(),
            source,
        }
    }

    pub fn pool(context: impl Into<String>, source: deadpool_postgres::PoolError) -> Self {
        Error::Pool {
            context: context.into(),
            source,
        }
    }

    /// Whether retrying the whole table sync could plausibly succeed.
    ///
    /// Only connection-level trouble and transaction conflicts qualify;
    /// configuration, schema and data errors never do.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database { source, .. } => is_transient_db_error(source),
            Error::Pool { source, .. } => match source {
                deadpool_postgres::PoolError::Timeout(_) => true,
                deadpool_postgres::PoolError::Backend(e) => is_transient_db_error(e),
                _ => false,
            },
            _ => false,
        }
    }

    /// SQLSTATE of the underlying database error, if any.
    pub fn sql_state(&self) -> Option<&SqlState> {
        match self {
            Error::Database { source, .. } => source.code(),
            _ => None,
        }
    }
}

fn is_transient_db_error(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    match err.code() {
        // Without a SQLSTATE only an I/O cause means the wire itself failed.
        None => std::error::Error::source(err).is_some_and(|cause| cause.is::<std::io::Error>()),
        Some(code) => is_transient_sql_state(code),
    }
}

pub(crate) fn is_transient_sql_state(code: &SqlState) -> bool {
    // Class 08: connection exception
    code.code().starts_with("08")
        || *code == SqlState::T_R_SERIALIZATION_FAILURE
        || *code == SqlState::T_R_DEADLOCK_DETECTED
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
        || *code == SqlState::TOO_MANY_CONNECTIONS
}

/// A table sync failure, carrying the table it happened on.
#[derive(Debug, Error)]
#[error("Sync failed for table {table}: {source}")]
pub struct SyncError {
    pub table: String,
    #[source]
    pub source: Error,
}

impl SyncError {
    pub fn new(table: impl Into<String>, source: Error) -> Self {
        Self {
            table: table.into(),
            source,
        }
    }

    pub fn kind(&self) -> &Error {
        &self.source
    }
}
