//! Shared types for the triage pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$").expect("valid address regex")
});

// ── Email ───────────────────────────────────────────────────────────

/// Reference to a file attached to an email.
///
/// `content` is only populated by connectors that download the part;
/// it never appears in serialized responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing)]
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: None,
            size: content.len() as u64,
            content,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// Email ids double as attachment directory names.
pub const MAX_EMAIL_ID_CHARS: usize = 255;
/// RFC 5322 line length limit.
pub const MAX_SUBJECT_CHARS: usize = 998;

/// Immutable input unit of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    /// Opaque ID assigned at ingestion. Unique within one run only.
    pub email_id: String,
    /// Connector thread identifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// `addr@example.com` or `Display Name <addr@example.com>`.
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl Email {
    pub fn new(
        email_id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            email_id: email_id.into(),
            thread_id: None,
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Reject input that cannot be classified or replied to.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.email_id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.email_id.chars().count() > MAX_EMAIL_ID_CHARS {
            return Err(ValidationError::TooLong {
                field: "email_id",
                max: MAX_EMAIL_ID_CHARS,
            });
        }
        if self.subject.chars().count() > MAX_SUBJECT_CHARS {
            return Err(ValidationError::TooLong {
                field: "subject",
                max: MAX_SUBJECT_CHARS,
            });
        }
        if self.sender.trim().is_empty() {
            return Err(ValidationError::EmptySender);
        }
        if self.reply_address().is_none() {
            return Err(ValidationError::InvalidSender(self.sender.clone()));
        }
        Ok(())
    }

    /// Bare address to reply to, handling `Name <addr>` senders.
    pub fn reply_address(&self) -> Option<&str> {
        let candidate = match (self.sender.find('<'), self.sender.rfind('>')) {
            (Some(start), Some(end)) if end > start => self.sender[start + 1..end].trim(),
            _ => self.sender.trim(),
        };
        ADDRESS_RE.is_match(candidate).then_some(candidate)
    }

    /// Display name from a `Name <addr>` sender, if present.
    pub fn display_name(&self) -> Option<&str> {
        let start = self.sender.find('<')?;
        let name = self.sender[..start].trim().trim_matches('"').trim();
        (!name.is_empty()).then_some(name)
    }

    /// Reply subject, `Re:` prefixed once.
    pub fn reply_subject(&self) -> String {
        let subject = self.subject.trim();
        if subject.to_lowercase().starts_with("re:") {
            subject.to_string()
        } else if subject.is_empty() {
            "Re: your message".to_string()
        } else {
            format!("Re: {subject}")
        }
    }
}

// ── Decision ────────────────────────────────────────────────────────

/// Coarse action category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Reply,
    Summarize,
    CreateTask,
    Ignore,
}

impl Intent {
    pub const ALL: [Intent; 4] = [Self::Reply, Self::Summarize, Self::CreateTask, Self::Ignore];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Summarize => "summarize",
            Self::CreateTask => "create_task",
            Self::Ignore => "ignore",
        }
    }

    /// Lenient parse of model output (`"Create Task"`, `"create-task"`).
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL.into_iter().find(|i| i.as_str() == normalized)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency tier. Ordered so escalation can compare with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Self::Low, Self::Medium, Self::High, Self::Urgent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        Self::ALL.into_iter().find(|p| p.as_str() == normalized)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Parsed from a language-model response.
    Model,
    /// Mock mode: keyword heuristics by construction.
    Heuristic,
    /// Provider failed or returned nothing usable.
    Fallback,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Heuristic => "heuristic",
            Self::Fallback => "fallback",
        }
    }
}

/// Structured classification of one email. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub intent: Intent,
    pub priority: Priority,
    #[serde(default)]
    pub entities: BTreeMap<String, String>,
    /// Always within `[0, 1]`.
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: String,
    pub source: DecisionSource,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    /// `ignore` / `low` / `0.0`: the value used when nothing else is known.
    pub fn safe_default(reason: impl Into<String>) -> Self {
        Self {
            intent: Intent::Ignore,
            priority: Priority::Low,
            entities: BTreeMap::new(),
            confidence: 0.0,
            reasoning: reason.into(),
            source: DecisionSource::Fallback,
            created_at: Utc::now(),
        }
    }

    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities.get(key).map(String::as_str)
    }
}

// ── Action results ──────────────────────────────────────────────────

pub const ACTION_AUTO_REPLY: &str = "auto_reply_sent";
pub const ACTION_TASK_CREATED: &str = "task_created";
pub const ACTION_SUMMARY: &str = "summary_created";
pub const ACTION_IGNORED: &str = "ignored";
pub const ACTION_ATTACHMENT_SAVED: &str = "attachment_saved";
pub const ACTION_HISTORY: &str = "history_recorded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Outcome of one attempted workflow action. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_name: String,
    pub status: ActionStatus,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ActionResult {
    fn new(action_name: &str, status: ActionStatus, detail: impl Into<String>) -> Self {
        Self {
            action_name: action_name.to_string(),
            status,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn succeeded(action_name: &str, detail: impl Into<String>) -> Self {
        Self::new(action_name, ActionStatus::Succeeded, detail)
    }

    pub fn failed(action_name: &str, detail: impl Into<String>) -> Self {
        Self::new(action_name, ActionStatus::Failed, detail)
    }

    pub fn skipped(action_name: &str, detail: impl Into<String>) -> Self {
        Self::new(action_name, ActionStatus::Skipped, detail)
    }
}
