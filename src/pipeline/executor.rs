//! Workflow Executor: decision in, action results out.
//!
//! At most one primary action per intent, gated on confidence, plus one
//! independent result per attachment. Every failure becomes a `failed`
//! result; nothing here returns an error.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::EmailSource;
use crate::config::WorkflowConfig;
use crate::error::ConnectorError;
use crate::pipeline::decision::DecisionEngine;
use crate::pipeline::heuristics::{ENTITY_CLIENT_NAME, ENTITY_DEADLINE, ENTITY_REQUEST_TYPE};
use crate::pipeline::types::{
    ACTION_ATTACHMENT_SAVED, ACTION_AUTO_REPLY, ACTION_IGNORED, ACTION_SUMMARY, ACTION_TASK_CREATED,
    ActionResult, ActionStatus, Decision, Email, Intent,
};
use crate::store::{AttachmentSink, Store, TaskRecord, TaskStatus};

const TASK_TITLE_SUBJECT_CHARS: usize = 50;
const TASK_BODY_PREVIEW_CHARS: usize = 500;
const SUMMARY_CHARS: usize = 200;

pub struct WorkflowExecutor {
    engine: Arc<DecisionEngine>,
    source: Arc<dyn EmailSource>,
    store: Arc<dyn Store>,
    attachments: Arc<dyn AttachmentSink>,
    config: WorkflowConfig,
}

impl WorkflowExecutor {
    pub fn new(
        engine: Arc<DecisionEngine>,
        source: Arc<dyn EmailSource>,
        store: Arc<dyn Store>,
        attachments: Arc<dyn AttachmentSink>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            engine,
            source,
            store,
            attachments,
            config,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Run the actions a decision calls for.
    ///
    /// `ignore` yields exactly one skipped result and touches nothing else.
    /// Not idempotent: executing twice sends twice.
    pub async fn execute(&self, email: &Email, decision: &Decision) -> Vec<ActionResult> {
        if decision.intent == Intent::Ignore {
            let reason = if decision.reasoning.is_empty() {
                "No action required"
            } else {
                decision.reasoning.as_str()
            };
            return vec![ActionResult::skipped(ACTION_IGNORED, format!("Ignored: {reason}"))];
        }

        let mut results = Vec::with_capacity(1 + email.attachments.len());
        results.push(self.primary(email, decision).await);
        results.extend(self.save_attachments(email).await);
        results
    }

    async fn primary(&self, email: &Email, decision: &Decision) -> ActionResult {
        let action = primary_action_name(decision.intent);
        if decision.confidence < self.config.confidence_threshold {
            info!(
                email_id = %email.email_id,
                action,
                confidence = decision.confidence,
                threshold = self.config.confidence_threshold,
                "Confidence gate suppressed primary action"
            );
            return ActionResult::skipped(
                action,
                format!(
                    "Confidence {:.2} below threshold {:.2}",
                    decision.confidence, self.config.confidence_threshold
                ),
            );
        }

        let result = match decision.intent {
            Intent::Reply => self.send_reply(email, decision).await,
            Intent::CreateTask => self.create_task(email, decision).await,
            Intent::Summarize => summarize_action(email, decision),
            Intent::Ignore => ActionResult::skipped(ACTION_IGNORED, "No action required"),
        };
        if result.status == ActionStatus::Failed {
            warn!(email_id = %email.email_id, action, detail = %result.detail, "Primary action failed");
        }
        result
    }

    async fn send_reply(&self, email: &Email, decision: &Decision) -> ActionResult {
        if !self.config.auto_reply_enabled {
            return ActionResult::skipped(ACTION_AUTO_REPLY, "Auto-reply disabled");
        }
        let Some(to) = email.reply_address() else {
            return ActionResult::failed(
                ACTION_AUTO_REPLY,
                format!("No reply address in sender '{}'", email.sender),
            );
        };

        let body = self.engine.compose_reply(email, decision).await;
        let subject = email.reply_subject();
        let timeout = self.config.send_timeout;
        let sent = match tokio::time::timeout(timeout, self.source.send(to, &subject, &body)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout {
                name: self.source.name().to_string(),
                timeout,
            }),
        };

        match sent {
            Ok(()) => {
                info!(email_id = %email.email_id, to, "Auto-reply sent");
                ActionResult::succeeded(ACTION_AUTO_REPLY, format!("Reply sent to {to}"))
            }
            Err(e) => ActionResult::failed(ACTION_AUTO_REPLY, e.to_string()),
        }
    }

    async fn create_task(&self, email: &Email, decision: &Decision) -> ActionResult {
        if !self.config.auto_task_enabled {
            return ActionResult::skipped(ACTION_TASK_CREATED, "Task creation disabled");
        }
        let task = build_task(email, decision);
        match self.store.create_task(&task).await {
            Ok(()) => {
                info!(email_id = %email.email_id, task_id = %task.task_id, "Task created");
                ActionResult::succeeded(
                    ACTION_TASK_CREATED,
                    format!("Task {} created: {}", task.task_id, task.title),
                )
            }
            Err(e) => ActionResult::failed(ACTION_TASK_CREATED, e.to_string()),
        }
    }

    /// One result per attachment, in order. A failure never stops the rest.
    async fn save_attachments(&self, email: &Email) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(email.attachments.len());
        for attachment in &email.attachments {
            if !self.config.save_attachments_enabled {
                results.push(ActionResult::skipped(
                    ACTION_ATTACHMENT_SAVED,
                    format!("Attachment saving disabled ({})", attachment.filename),
                ));
                continue;
            }
            let result = match self.attachments.save(&email.email_id, attachment).await {
                Ok(path) => ActionResult::succeeded(ACTION_ATTACHMENT_SAVED, format!("Saved to {path}")),
                Err(e) => {
                    warn!(email_id = %email.email_id, filename = %attachment.filename, error = %e, "Attachment save failed");
                    ActionResult::failed(ACTION_ATTACHMENT_SAVED, e.to_string())
                }
            };
            results.push(result);
        }
        results
    }
}

fn primary_action_name(intent: Intent) -> &'static str {
    match intent {
        Intent::Reply => ACTION_AUTO_REPLY,
        Intent::CreateTask => ACTION_TASK_CREATED,
        Intent::Summarize => ACTION_SUMMARY,
        Intent::Ignore => ACTION_IGNORED,
    }
}

fn summarize_action(email: &Email, decision: &Decision) -> ActionResult {
    let summary = summarize(email, decision);
    info!(email_id = %email.email_id, %summary, "Summary created");
    ActionResult::succeeded(ACTION_SUMMARY, summary)
}

/// One-line summary: priority, sender, subject, and the start of the body.
pub fn summarize(email: &Email, decision: &Decision) -> String {
    let body = email.body.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut preview: String = body.chars().take(SUMMARY_CHARS).collect();
    if body.chars().count() > SUMMARY_CHARS {
        preview.push_str("...");
    }
    let subject = if email.subject.trim().is_empty() {
        "(no subject)"
    } else {
        email.subject.trim()
    };
    if preview.is_empty() {
        format!("[{}] {} - {subject}", decision.priority, email.sender)
    } else {
        format!("[{}] {} - {subject}: {preview}", decision.priority, email.sender)
    }
}

/// Task record for a `create_task` decision.
pub fn build_task(email: &Email, decision: &Decision) -> TaskRecord {
    let request_type = decision
        .entity(ENTITY_REQUEST_TYPE)
        .map(title_case)
        .unwrap_or_else(|| "General Request".to_string());
    let subject = if email.subject.trim().is_empty() {
        "No Subject".to_string()
    } else {
        email.subject.chars().take(TASK_TITLE_SUBJECT_CHARS).collect()
    };
    let body_preview: String = email.body.chars().take(TASK_BODY_PREVIEW_CHARS).collect();
    let description = format!(
        "Email from: {}\nSubject: {}\nPriority: {}\nIntent: {}\n\nEmail Body:\n{}\n\nReasoning: {}",
        email.sender,
        email.subject,
        decision.priority.as_str().to_uppercase(),
        decision.intent,
        body_preview,
        decision.reasoning,
    );

    TaskRecord {
        task_id: format!("task_{}", Uuid::new_v4().simple()),
        title: format!("{request_type}: {subject}"),
        description,
        priority: decision.priority,
        client_name: decision.entity(ENTITY_CLIENT_NAME).map(str::to_string),
        due: decision.entity(ENTITY_DEADLINE).map(str::to_string),
        source_email_id: email.email_id.clone(),
        status: TaskStatus::Pending,
        created_at: Utc::now(),
    }
}

/// `meeting_request` → `Meeting Request`.
fn title_case(raw: &str) -> String {
    raw.split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{FetchFilter, MockMailbox};
    use crate::config::DecisionConfig;
    use crate::error::DatabaseError;
    use crate::llm::HeuristicProvider;
    use crate::pipeline::heuristics::KeywordHeuristics;
    use crate::pipeline::types::{Attachment, DecisionSource, Priority};
    use crate::store::{AttachmentStore, HistoryEntry, LibSqlBackend, WorkflowLogEntry};

    /// Store that records created tasks and can be told to fail.
    #[derive(Default)]
    struct RecordingStore {
        tasks: Mutex<Vec<TaskRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn init_schema(&self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn append_history(&self, _: &Email, _: &Decision) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn create_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
            if self.fail {
                return Err(DatabaseError::Query("disk full".into()));
            }
            self.tasks.lock().unwrap().push(task.clone());
            Ok(())
        }
        async fn append_workflow_log(&self, _: &str, _: &ActionResult) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn history(&self, _: usize) -> Result<Vec<HistoryEntry>, DatabaseError> {
            Ok(Vec::new())
        }
        async fn tasks(&self, _: Option<TaskStatus>) -> Result<Vec<TaskRecord>, DatabaseError> {
            Ok(self.tasks.lock().unwrap().clone())
        }
        async fn workflow_logs(&self, _: usize) -> Result<Vec<WorkflowLogEntry>, DatabaseError> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        executor: WorkflowExecutor,
        mailbox: Arc<MockMailbox>,
        store: Arc<RecordingStore>,
        _dir: tempfile::TempDir,
    }

    fn harness(config: WorkflowConfig, store: RecordingStore) -> Harness {
        let heuristics = KeywordHeuristics::default();
        let engine = Arc::new(DecisionEngine::new(
            Arc::new(HeuristicProvider::new(heuristics)),
            DecisionConfig::default(),
        ));
        let mailbox = Arc::new(MockMailbox::new());
        let store = Arc::new(store);
        let dir = tempfile::tempdir().unwrap();
        let executor = WorkflowExecutor::new(
            engine,
            mailbox.clone(),
            store.clone(),
            Arc::new(AttachmentStore::new(dir.path())),
            config,
        );
        Harness {
            executor,
            mailbox,
            store,
            _dir: dir,
        }
    }

    fn decision(intent: Intent, confidence: f32) -> Decision {
        let mut decision = Decision::safe_default("test");
        decision.intent = intent;
        decision.priority = Priority::High;
        decision.confidence = confidence;
        decision.source = DecisionSource::Model;
        decision
    }

    fn email() -> Email {
        Email::new(
            "e1",
            "Jane Client <jane@example.com>",
            "Schedule a call",
            "Can we meet by Friday?",
        )
    }

    #[tokio::test]
    async fn low_confidence_skips_primary_for_every_intent() {
        let h = harness(WorkflowConfig::default(), RecordingStore::default());
        for intent in [Intent::Reply, Intent::CreateTask, Intent::Summarize] {
            let results = h.executor.execute(&email(), &decision(intent, 0.49)).await;
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].status, ActionStatus::Skipped, "{intent}");
            assert!(results[0].detail.contains("below threshold"));
        }
        assert!(h.mailbox.sent().is_empty());
        assert!(h.store.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ignore_has_no_side_effects() {
        let h = harness(WorkflowConfig::default(), RecordingStore::default());
        let email = email().with_attachments(vec![Attachment::new("a.txt", b"a".to_vec())]);

        let results = h.executor.execute(&email, &decision(Intent::Ignore, 1.0)).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action_name, ACTION_IGNORED);
        assert_eq!(results[0].status, ActionStatus::Skipped);
        assert!(h.mailbox.sent().is_empty());
        assert!(h.store.tasks.lock().unwrap().is_empty());
        assert!(std::fs::read_dir(h._dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn reply_is_sent_through_source() {
        let h = harness(WorkflowConfig::default(), RecordingStore::default());
        let results = h.executor.execute(&email(), &decision(Intent::Reply, 0.9)).await;

        assert_eq!(results[0].action_name, ACTION_AUTO_REPLY);
        assert_eq!(results[0].status, ActionStatus::Succeeded);
        let sent = h.mailbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "jane@example.com");
        assert_eq!(sent[0].subject, "Re: Schedule a call");
        assert!(sent[0].body.starts_with("Hi Jane Client,"));
    }

    #[tokio::test]
    async fn send_failure_is_a_failed_result() {
        let h = harness(WorkflowConfig::default(), RecordingStore::default());
        h.mailbox.fail_sends(true);
        let results = h.executor.execute(&email(), &decision(Intent::Reply, 0.9)).await;
        assert_eq!(results[0].status, ActionStatus::Failed);
        assert!(results[0].detail.contains("Failed to send"));
    }

    /// Mailbox whose SMTP side never answers.
    struct StalledMailbox;

    #[async_trait]
    impl EmailSource for StalledMailbox {
        fn name(&self) -> &str {
            "stalled"
        }
        async fn fetch(&self, _: &FetchFilter, _: usize) -> Result<Vec<Email>, ConnectorError> {
            Ok(Vec::new())
        }
        async fn send(&self, _: &str, _: &str, _: &str) -> Result<(), ConnectorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_send_times_out_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = WorkflowExecutor::new(
            Arc::new(DecisionEngine::new(
                Arc::new(HeuristicProvider::new(KeywordHeuristics::default())),
                DecisionConfig::default(),
            )),
            Arc::new(StalledMailbox),
            Arc::new(RecordingStore::default()),
            Arc::new(AttachmentStore::new(dir.path())),
            WorkflowConfig {
                send_timeout: Duration::from_millis(20),
                ..WorkflowConfig::default()
            },
        );

        let started = std::time::Instant::now();
        let results = executor.execute(&email(), &decision(Intent::Reply, 0.9)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action_name, ACTION_AUTO_REPLY);
        assert_eq!(results[0].status, ActionStatus::Failed);
        let expected = ConnectorError::Timeout {
            name: "stalled".into(),
            timeout: Duration::from_millis(20),
        };
        assert_eq!(results[0].detail, expected.to_string());
    }

    #[tokio::test]
    async fn task_carries_entities() {
        let h = harness(WorkflowConfig::default(), RecordingStore::default());
        let mut d = decision(Intent::CreateTask, 0.9);
        d.entities.insert(ENTITY_REQUEST_TYPE.into(), "meeting_request".into());
        d.entities.insert(ENTITY_DEADLINE.into(), "Friday".into());
        d.entities.insert(ENTITY_CLIENT_NAME.into(), "Jane Client".into());

        let results = h.executor.execute(&email(), &d).await;

        assert_eq!(results[0].status, ActionStatus::Succeeded);
        let tasks = h.store.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Meeting Request: Schedule a call");
        assert_eq!(tasks[0].due.as_deref(), Some("Friday"));
        assert_eq!(tasks[0].client_name.as_deref(), Some("Jane Client"));
        assert_eq!(tasks[0].priority, Priority::High);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert!(tasks[0].task_id.starts_with("task_"));
        assert!(tasks[0].description.contains("Priority: HIGH"));
    }

    #[tokio::test]
    async fn store_failure_is_a_failed_result() {
        let h = harness(
            WorkflowConfig::default(),
            RecordingStore {
                fail: true,
                ..RecordingStore::default()
            },
        );
        let results = h.executor.execute(&email(), &decision(Intent::CreateTask, 0.9)).await;
        assert_eq!(results[0].status, ActionStatus::Failed);
        assert!(results[0].detail.contains("disk full"));
    }

    #[tokio::test]
    async fn attachment_failures_are_independent() {
        let h = harness(WorkflowConfig::default(), RecordingStore::default());
        let email = email().with_attachments(vec![
            Attachment::new("one.txt", b"1".to_vec()),
            Attachment::new("../two.txt", b"2".to_vec()),
            Attachment::new("three.txt", b"3".to_vec()),
        ]);

        let results = h.executor.execute(&email, &decision(Intent::Summarize, 0.9)).await;

        let statuses: Vec<ActionStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ActionStatus::Succeeded,
                ActionStatus::Succeeded,
                ActionStatus::Failed,
                ActionStatus::Succeeded,
            ]
        );
        assert_eq!(results[0].action_name, ACTION_SUMMARY);
        assert!(results[1..].iter().all(|r| r.action_name == ACTION_ATTACHMENT_SAVED));
    }

    #[tokio::test]
    async fn disabled_toggles_skip() {
        let config = WorkflowConfig {
            auto_reply_enabled: false,
            auto_task_enabled: false,
            save_attachments_enabled: false,
            ..WorkflowConfig::default()
        };
        let h = harness(config, RecordingStore::default());
        let email = email().with_attachments(vec![Attachment::new("a.txt", b"a".to_vec())]);

        let reply = h.executor.execute(&email, &decision(Intent::Reply, 0.9)).await;
        let task = h.executor.execute(&email, &decision(Intent::CreateTask, 0.9)).await;

        for results in [&reply, &task] {
            assert_eq!(results.len(), 2);
            assert!(results.iter().all(|r| r.status == ActionStatus::Skipped));
            assert!(results.iter().all(|r| r.detail.contains("disabled")));
        }
        assert!(h.mailbox.sent().is_empty());
        assert!(h.store.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tasks_persist_to_libsql() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let engine = Arc::new(DecisionEngine::new(
            Arc::new(HeuristicProvider::new(KeywordHeuristics::default())),
            DecisionConfig::default(),
        ));
        let dir = tempfile::tempdir().unwrap();
        let executor = WorkflowExecutor::new(
            engine,
            Arc::new(MockMailbox::new()),
            store.clone(),
            Arc::new(AttachmentStore::new(dir.path())),
            WorkflowConfig::default(),
        );

        executor.execute(&email(), &decision(Intent::CreateTask, 0.9)).await;

        let tasks = store.tasks(Some(TaskStatus::Pending)).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source_email_id, "e1");
    }

    #[test]
    fn summary_truncates_body() {
        let email = Email::new("e", "a@example.com", "Status", "word ".repeat(100));
        let summary = summarize(&email, &decision(Intent::Summarize, 0.9));
        assert!(summary.starts_with("[high] a@example.com - Status: word word"));
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn title_case_request_types() {
        assert_eq!(title_case("meeting_request"), "Meeting Request");
        assert_eq!(title_case("STATUS update"), "Status Update");
    }
}
