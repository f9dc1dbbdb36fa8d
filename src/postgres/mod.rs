// ABOUTME: PostgreSQL connectivity for source and target databases
// ABOUTME: Exposes pool construction, TLS policy and health probes

pub mod connection;

pub use connection::{build_tls_connector, create_pool, ping, Pools};
