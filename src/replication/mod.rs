// ABOUTME: Incremental table replication engine
// ABOUTME: Schema mirroring, cursors, change reads, upserts, reconciliation and orchestration

pub mod metadata;
pub mod orchestrator;
pub mod reader;
pub mod reconciler;
pub mod record;
pub mod scheduler;
pub mod schema;
pub mod writer;

pub use metadata::{apply_safety_margin, CursorEntry, MetadataStore};
pub use orchestrator::{SyncOrchestrator, SyncPhase, SyncProgress, SyncReport, TableCounts};
pub use reader::ChangeFeed;
pub use reconciler::Reconciler;
pub use record::{Record, Value};
pub use schema::{ColumnDefinition, SchemaMirror};
pub use writer::Upserter;
