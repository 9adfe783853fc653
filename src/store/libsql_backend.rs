//! libSQL backend: async `Store` implementation.
//!
//! Supports local file and in-memory databases. Every write is a single
//! statement, so one email's rows never interleave partially with another's.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::{ActionResult, ActionStatus, Decision, Email, Priority};
use crate::store::migrations;
use crate::store::traits::{
    HistoryEntry, Store, TaskRecord, TaskStatus, WorkflowLogEntry, check_limit,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and throwaway runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn str_to_action_status(s: &str) -> ActionStatus {
    match s {
        "succeeded" => ActionStatus::Succeeded,
        "skipped" => ActionStatus::Skipped,
        _ => ActionStatus::Failed,
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_history(row: &libsql::Row) -> Result<HistoryEntry, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("history row parse: {e}"));
    let decision_json: String = row.get(4).map_err(parse)?;
    let decision: Decision = serde_json::from_str(&decision_json)
        .map_err(|e| DatabaseError::Serialization(format!("history decision: {e}")))?;
    let recorded: String = row.get(5).map_err(parse)?;
    Ok(HistoryEntry {
        id: row.get(0).map_err(parse)?,
        email_id: row.get(1).map_err(parse)?,
        sender: row.get(2).map_err(parse)?,
        subject: row.get(3).map_err(parse)?,
        decision,
        recorded_at: parse_datetime(&recorded),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));
    let priority: String = row.get(3).map_err(parse)?;
    let status: String = row.get(7).map_err(parse)?;
    let created: String = row.get(8).map_err(parse)?;
    Ok(TaskRecord {
        task_id: row.get(0).map_err(parse)?,
        title: row.get(1).map_err(parse)?,
        description: row.get(2).map_err(parse)?,
        priority: Priority::parse(&priority).unwrap_or(Priority::Low),
        client_name: row.get::<String>(4).ok(),
        due: row.get::<String>(5).ok(),
        source_email_id: row.get(6).map_err(parse)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        created_at: parse_datetime(&created),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<WorkflowLogEntry, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("workflow log row parse: {e}"));
    let status: String = row.get(3).map_err(parse)?;
    let timestamp: String = row.get(5).map_err(parse)?;
    Ok(WorkflowLogEntry {
        id: row.get(0).map_err(parse)?,
        email_id: row.get(1).map_err(parse)?,
        result: ActionResult {
            action_name: row.get(2).map_err(parse)?,
            status: str_to_action_status(&status),
            detail: row.get(4).map_err(parse)?,
            timestamp: parse_datetime(&timestamp),
        },
    })
}

// ── Trait implementation ────────────────────────────────────────────

const HISTORY_COLUMNS: &str = "id, email_id, sender, subject, decision, recorded_at";

const TASK_COLUMNS: &str =
    "task_id, title, description, priority, client_name, due, source_email_id, status, created_at";

const LOG_COLUMNS: &str = "id, email_id, action_name, status, detail, timestamp";

#[async_trait]
impl Store for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn append_history(&self, email: &Email, decision: &Decision) -> Result<(), DatabaseError> {
        let decision_json = serde_json::to_string(decision)
            .map_err(|e| DatabaseError::Serialization(format!("decision: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO email_history (email_id, thread_id, sender, subject, intent, priority,
                    confidence, source, decision, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    email.email_id.as_str(),
                    opt_text(email.thread_id.as_deref()),
                    email.sender.as_str(),
                    email.subject.as_str(),
                    decision.intent.as_str(),
                    decision.priority.as_str(),
                    f64::from(decision.confidence),
                    decision.source.as_str(),
                    decision_json,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_history: {e}")))?;

        debug!(email_id = %email.email_id, intent = %decision.intent, "History recorded");
        Ok(())
    }

    async fn create_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tasks (task_id, title, description, priority, client_name, due,
                    source_email_id, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    task.task_id.as_str(),
                    task.title.as_str(),
                    task.description.as_str(),
                    task.priority.as_str(),
                    opt_text(task.client_name.as_deref()),
                    opt_text(task.due.as_deref()),
                    task.source_email_id.as_str(),
                    task.status.as_str(),
                    task.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        debug!(task_id = %task.task_id, email_id = %task.source_email_id, "Task created");
        Ok(())
    }

    async fn append_workflow_log(
        &self,
        email_id: &str,
        result: &ActionResult,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO workflow_logs (email_id, action_name, status, detail, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    email_id,
                    result.action_name.as_str(),
                    result.status.as_str(),
                    result.detail.as_str(),
                    result.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_workflow_log: {e}")))?;
        Ok(())
    }

    async fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, DatabaseError> {
        let limit = check_limit(limit)?;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {HISTORY_COLUMNS} FROM email_history ORDER BY id DESC LIMIT ?1"),
                params![limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("history: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("history: {e}")))?
        {
            match row_to_history(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping history row: {e}"),
            }
        }
        Ok(entries)
    }

    async fn tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = match status {
            Some(status) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at DESC"
                        ),
                        params![status.as_str()],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC"),
                        (),
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("tasks: {e}")))?
        {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn workflow_logs(&self, limit: usize) -> Result<Vec<WorkflowLogEntry>, DatabaseError> {
        let limit = check_limit(limit)?;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM workflow_logs ORDER BY id DESC LIMIT ?1"),
                params![limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("workflow_logs: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("workflow_logs: {e}")))?
        {
            match row_to_log(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping workflow log row: {e}"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::pipeline::types::{DecisionSource, Intent};

    fn decision(intent: Intent, priority: Priority) -> Decision {
        let mut entities = BTreeMap::new();
        entities.insert("client_name".to_string(), "Acme".to_string());
        Decision {
            intent,
            priority,
            entities,
            confidence: 0.75,
            reasoning: "test".into(),
            source: DecisionSource::Model,
            created_at: Utc::now(),
        }
    }

    fn task(id: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            task_id: id.into(),
            title: "Meeting Request: Kickoff".into(),
            description: "From: a@b.co".into(),
            priority: Priority::High,
            client_name: Some("Acme".into()),
            due: None,
            source_email_id: "e1".into(),
            status,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn history_is_append_only_and_newest_first() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let email = Email::new("e1", "a@b.co", "Kickoff", "Let's meet");
        db.append_history(&email, &decision(Intent::CreateTask, Priority::High))
            .await
            .unwrap();
        db.append_history(&email, &decision(Intent::Reply, Priority::Urgent))
            .await
            .unwrap();

        let history = db.history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].decision.intent, Intent::Reply);
        assert_eq!(history[1].decision.intent, Intent::CreateTask);
        assert_eq!(history[0].decision.entity("client_name"), Some("Acme"));
        assert_eq!(history[0].decision.confidence, 0.75);

        assert_eq!(db.history(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(matches!(db.history(0).await, Err(DatabaseError::InvalidArgument(_))));
        assert!(matches!(
            db.workflow_logs(0).await,
            Err(DatabaseError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn tasks_filter_by_status() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.create_task(&task("task_1", TaskStatus::Pending)).await.unwrap();
        db.create_task(&task("task_2", TaskStatus::Completed)).await.unwrap();

        assert_eq!(db.tasks(None).await.unwrap().len(), 2);
        let pending = db.tasks(Some(TaskStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "task_1");
        assert_eq!(pending[0].client_name.as_deref(), Some("Acme"));
        assert_eq!(pending[0].due, None);
    }

    #[tokio::test]
    async fn duplicate_task_id_is_a_query_error() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.create_task(&task("task_1", TaskStatus::Pending)).await.unwrap();
        let err = db.create_task(&task("task_1", TaskStatus::Pending)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Query(_)));
    }

    #[tokio::test]
    async fn workflow_logs_roundtrip() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.append_workflow_log("e1", &ActionResult::succeeded("task_created", "task_1"))
            .await
            .unwrap();
        db.append_workflow_log("e1", &ActionResult::failed("auto_reply_sent", "smtp down"))
            .await
            .unwrap();

        let logs = db.workflow_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].result.action_name, "auto_reply_sent");
        assert_eq!(logs[0].result.status, ActionStatus::Failed);
        assert_eq!(logs[1].result.status, ActionStatus::Succeeded);
    }

    #[tokio::test]
    async fn local_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("triage.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.create_task(&task("task_1", TaskStatus::Pending)).await.unwrap();
        assert!(path.exists());
    }
}
