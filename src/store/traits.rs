//! `Store` trait: the persistence collaborator of the pipeline.
//!
//! Each write is independently failable; callers turn failures into failed
//! action results rather than aborting an email.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::pipeline::types::{ActionResult, Decision, Email, Priority};

/// Lifecycle of a created task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task derived from a `create_task` decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub client_name: Option<String>,
    /// Free-form deadline as extracted (`Friday`, `2024-05-01`).
    pub due: Option<String>,
    pub source_email_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

/// One classified email as recorded in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub email_id: String,
    pub sender: String,
    pub subject: String,
    pub decision: Decision,
    pub recorded_at: DateTime<Utc>,
}

/// One action result as recorded in the workflow log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLogEntry {
    pub id: i64,
    pub email_id: String,
    #[serde(flatten)]
    pub result: ActionResult,
}

/// Backend-agnostic persistence for history, tasks, and workflow logs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Writes ──────────────────────────────────────────────────────

    /// Append one classified email. Never overwrites earlier entries.
    async fn append_history(&self, email: &Email, decision: &Decision) -> Result<(), DatabaseError>;

    async fn create_task(&self, task: &TaskRecord) -> Result<(), DatabaseError>;

    async fn append_workflow_log(
        &self,
        email_id: &str,
        result: &ActionResult,
    ) -> Result<(), DatabaseError>;

    // ── Reads ───────────────────────────────────────────────────────

    /// Most recent history entries first. `limit` must be at least 1.
    async fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, DatabaseError>;

    /// Tasks, newest first, optionally filtered by status.
    async fn tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Most recent workflow log entries first. `limit` must be at least 1.
    async fn workflow_logs(&self, limit: usize) -> Result<Vec<WorkflowLogEntry>, DatabaseError>;
}

/// Reject a zero read limit.
pub(crate) fn check_limit(limit: usize) -> Result<i64, DatabaseError> {
    if limit == 0 {
        return Err(DatabaseError::InvalidArgument("limit must be at least 1".into()));
    }
    Ok(i64::try_from(limit).unwrap_or(i64::MAX))
}
