//! Persistence layer: libSQL-backed history, tasks, and workflow logs, plus
//! attachment storage on the local filesystem.

pub mod attachments;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use attachments::{AttachmentSink, AttachmentStore};
pub use libsql_backend::LibSqlBackend;
pub use traits::{HistoryEntry, Store, TaskRecord, TaskStatus, WorkflowLogEntry};
