//! Pipeline Coordinator: fetch → decide → execute → persist.
//!
//! One email's failure (including a panic) never stops the batch. Each
//! email moves through `EmailProgress`; the batch aggregates into a
//! transient `BatchSummary`.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channels::{EmailSource, FetchFilter};
use crate::config::{PipelineConfig, WorkflowConfig};
use crate::error::PipelineError;
use crate::pipeline::decision::DecisionEngine;
use crate::pipeline::executor::WorkflowExecutor;
use crate::pipeline::state::{EmailProgress, EmailState};
use crate::pipeline::types::{ACTION_HISTORY, ActionResult, ActionStatus, Decision, Email};
use crate::store::{AttachmentSink, Store};

/// What `run_one` hands back for a classified email.
#[derive(Debug, Clone, Serialize)]
pub struct EmailOutcome {
    pub email_id: String,
    pub state: EmailState,
    pub decision: Decision,
    pub actions: Vec<ActionResult>,
}

/// One processed (or failed) email in a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub email_id: String,
    pub state: EmailState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItem {
    fn failed(email_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            email_id: email_id.into(),
            state: EmailState::Failed,
            decision: None,
            actions: Vec::new(),
            error: Some(error.into()),
        }
    }
}

impl From<EmailOutcome> for BatchItem {
    fn from(outcome: EmailOutcome) -> Self {
        Self {
            email_id: outcome.email_id,
            state: outcome.state,
            decision: Some(outcome.decision),
            actions: outcome.actions,
            error: None,
        }
    }
}

/// Aggregate of one run. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    /// Emails handed to the run, duplicates and capped ones included.
    pub total: usize,
    /// Completed or partially failed.
    pub processed: usize,
    /// Subset of `processed` with at least one failed action.
    pub partially_failed: usize,
    pub failed: usize,
    /// Duplicate ids within the run.
    pub skipped: usize,
    /// Not started because the run was cancelled.
    pub cancelled: usize,
    /// Beyond `max_emails_per_run`.
    pub capped: usize,
    pub by_intent: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
    pub items: Vec<BatchItem>,
}

impl BatchSummary {
    /// Fold one finished item in. Counts are commutative.
    pub fn record(&mut self, item: BatchItem) {
        if item.state.is_processed() {
            self.processed += 1;
            if item.state == EmailState::PartiallyFailed {
                self.partially_failed += 1;
            }
        } else {
            self.failed += 1;
        }
        if let Some(decision) = &item.decision {
            *self.by_intent.entry(decision.intent.as_str().to_string()).or_insert(0) += 1;
        }
        self.items.push(item);
    }
}

pub struct Pipeline {
    engine: Arc<DecisionEngine>,
    executor: WorkflowExecutor,
    source: Arc<dyn EmailSource>,
    store: Arc<dyn Store>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        engine: Arc<DecisionEngine>,
        source: Arc<dyn EmailSource>,
        store: Arc<dyn Store>,
        attachments: Arc<dyn AttachmentSink>,
        workflow: WorkflowConfig,
        config: PipelineConfig,
    ) -> Self {
        let executor = WorkflowExecutor::new(
            Arc::clone(&engine),
            Arc::clone(&source),
            Arc::clone(&store),
            attachments,
            workflow,
        );
        Self {
            engine,
            executor,
            source,
            store,
            config,
        }
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn source(&self) -> &dyn EmailSource {
        self.source.as_ref()
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Classify and act on one email.
    ///
    /// Only invalid input is an error. Persistence failures show up as
    /// failed action results next to the decision.
    pub async fn run_one(&self, email: &Email) -> Result<EmailOutcome, PipelineError> {
        email.validate()?;
        let mut progress = EmailProgress::new(&email.email_id);

        let decision = self.engine.classify(email).await;
        advance(&mut progress, EmailState::Decided, None);
        info!(
            email_id = %email.email_id,
            intent = %decision.intent,
            priority = %decision.priority,
            confidence = decision.confidence,
            source = decision.source.as_str(),
            "Email classified"
        );

        let mut actions = Vec::new();
        if let Err(e) = self.store.append_history(email, &decision).await {
            warn!(email_id = %email.email_id, error = %e, "Failed to record history");
            actions.push(ActionResult::failed(ACTION_HISTORY, e.to_string()));
        }

        advance(&mut progress, EmailState::Executing, None);
        actions.extend(self.executor.execute(email, &decision).await);

        let state = EmailState::from_actions(&actions);
        let failed = actions.iter().filter(|a| a.status == ActionStatus::Failed).count();
        advance(
            &mut progress,
            state,
            (failed > 0).then(|| format!("{failed} action(s) failed")),
        );

        for action in &actions {
            if let Err(e) = self.store.append_workflow_log(&email.email_id, action).await {
                warn!(email_id = %email.email_id, action = %action.action_name, error = %e, "Failed to log action");
            }
        }

        info!(email_id = %email.email_id, state = %state, actions = actions.len(), "Email processed");
        Ok(EmailOutcome {
            email_id: email.email_id.clone(),
            state,
            decision,
            actions,
        })
    }

    /// Process a batch. Cancellation is checked before each email starts;
    /// an email already in flight always finishes.
    pub async fn run(&self, emails: Vec<Email>, cancel: &AtomicBool) -> BatchSummary {
        let started = Instant::now();
        let mut summary = BatchSummary {
            total: emails.len(),
            ..BatchSummary::default()
        };

        let mut seen = HashSet::new();
        let mut admitted = Vec::new();
        for email in emails {
            if !seen.insert(email.email_id.clone()) {
                debug!(email_id = %email.email_id, "Skipping duplicate email");
                summary.skipped += 1;
            } else if admitted.len() >= self.config.max_emails_per_run {
                summary.capped += 1;
            } else {
                admitted.push(email);
            }
        }
        if summary.capped > 0 {
            warn!(
                capped = summary.capped,
                max = self.config.max_emails_per_run,
                "Batch exceeds per-run cap"
            );
        }

        let admitted_count = admitted.len();
        let mut finished = 0;
        let mut results = stream::iter(admitted)
            .take_while(|_| futures::future::ready(!cancel.load(Ordering::SeqCst)))
            .map(|email| async move {
                let result = AssertUnwindSafe(self.run_one(&email)).catch_unwind().await;
                match result {
                    Ok(Ok(outcome)) => BatchItem::from(outcome),
                    Ok(Err(e)) => {
                        warn!(email_id = %email.email_id, error = %e, "Email rejected");
                        BatchItem::failed(&email.email_id, e.to_string())
                    }
                    Err(panic) => {
                        let e = PipelineError::Panicked {
                            email_id: email.email_id.clone(),
                            reason: panic_message(panic.as_ref()),
                        };
                        error!(email_id = %email.email_id, error = %e, "Email processing panicked");
                        BatchItem::failed(&email.email_id, e.to_string())
                    }
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(item) = results.next().await {
            finished += 1;
            summary.record(item);
        }

        summary.cancelled = admitted_count - finished;
        if summary.cancelled > 0 {
            info!(cancelled = summary.cancelled, "Batch cancelled before completion");
        }
        summary.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            total = summary.total,
            processed = summary.processed,
            failed = summary.failed,
            skipped = summary.skipped,
            capped = summary.capped,
            elapsed_ms = summary.elapsed_ms,
            "Batch complete"
        );
        summary
    }

    /// Fetch from the email source, then `run`. Only a fetch failure is an
    /// error; it aborts this run and nothing else.
    pub async fn run_from_source(
        &self,
        filter: &FetchFilter,
        max_emails: usize,
        cancel: &AtomicBool,
    ) -> Result<BatchSummary, PipelineError> {
        let max_count = max_emails.min(self.config.max_emails_per_run);
        let emails = self.source.fetch(filter, max_count).await?;
        info!(source = self.source.name(), fetched = emails.len(), "Fetched batch");
        Ok(self.run(emails, cancel).await)
    }
}

fn advance(progress: &mut EmailProgress, state: EmailState, reason: Option<String>) {
    if let Err(e) = progress.transition_to(state, reason) {
        warn!(email_id = %progress.email_id, error = %e, "Unexpected state transition");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::MockMailbox;
    use crate::config::DecisionConfig;
    use crate::error::DatabaseError;
    use crate::llm::HeuristicProvider;
    use crate::pipeline::heuristics::KeywordHeuristics;
    use crate::pipeline::types::{Intent, Priority};
    use crate::store::{
        AttachmentStore, HistoryEntry, LibSqlBackend, TaskRecord, TaskStatus, WorkflowLogEntry,
    };

    /// Store double: panics on one email id, optionally fails history
    /// writes, and can raise a cancel flag when it sees a given email.
    #[derive(Default)]
    struct TrapStore {
        panic_on: Option<String>,
        fail_history: bool,
        cancel_on: Option<(String, Arc<AtomicBool>)>,
        logs: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Store for TrapStore {
        async fn init_schema(&self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn append_history(&self, email: &Email, _: &Decision) -> Result<(), DatabaseError> {
            if self.panic_on.as_deref() == Some(email.email_id.as_str()) {
                panic!("storage exploded");
            }
            if let Some((id, flag)) = &self.cancel_on
                && *id == email.email_id
            {
                flag.store(true, Ordering::SeqCst);
            }
            if self.fail_history {
                return Err(DatabaseError::Query("history table locked".into()));
            }
            Ok(())
        }
        async fn create_task(&self, _: &TaskRecord) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn append_workflow_log(&self, email_id: &str, result: &ActionResult) -> Result<(), DatabaseError> {
            self.logs
                .lock()
                .unwrap()
                .push((email_id.to_string(), result.action_name.clone()));
            Ok(())
        }
        async fn history(&self, _: usize) -> Result<Vec<HistoryEntry>, DatabaseError> {
            Ok(Vec::new())
        }
        async fn tasks(&self, _: Option<TaskStatus>) -> Result<Vec<TaskRecord>, DatabaseError> {
            Ok(Vec::new())
        }
        async fn workflow_logs(&self, _: usize) -> Result<Vec<WorkflowLogEntry>, DatabaseError> {
            Ok(Vec::new())
        }
    }

    fn pipeline_with(
        store: Arc<dyn Store>,
        mailbox: Arc<MockMailbox>,
        config: PipelineConfig,
    ) -> (Pipeline, tempfile::TempDir) {
        let engine = Arc::new(DecisionEngine::new(
            Arc::new(HeuristicProvider::new(KeywordHeuristics::default())),
            DecisionConfig::default(),
        ));
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            engine,
            mailbox,
            store,
            Arc::new(AttachmentStore::new(dir.path())),
            WorkflowConfig::default(),
            config,
        );
        (pipeline, dir)
    }

    fn emails(n: usize) -> Vec<Email> {
        (1..=n)
            .map(|i| {
                Email::new(
                    format!("e{i}"),
                    format!("client{i}@example.com"),
                    "Status update",
                    "Here is the weekly progress report.",
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn run_one_records_decision_and_actions() {
        let store = Arc::new(TrapStore::default());
        let (pipeline, _dir) = pipeline_with(store.clone(), Arc::new(MockMailbox::new()), PipelineConfig::default());
        let email = Email::new("e1", "client@x.com", "Urgent: Need Help", "This is urgent, please fix asap");

        let outcome = pipeline.run_one(&email).await.unwrap();

        assert_eq!(outcome.decision.priority, Priority::Urgent);
        assert_eq!(outcome.decision.intent, Intent::Reply);
        assert_eq!(outcome.state, EmailState::Completed);
        let logs = store.logs.lock().unwrap();
        assert_eq!(logs.len(), outcome.actions.len());
        assert!(logs.iter().all(|(id, _)| id == "e1"));
    }

    #[tokio::test]
    async fn invalid_email_is_rejected_before_classification() {
        let store = Arc::new(TrapStore::default());
        let (pipeline, _dir) = pipeline_with(store.clone(), Arc::new(MockMailbox::new()), PipelineConfig::default());

        let err = pipeline
            .run_one(&Email::new("e1", "not-an-address", "hi", "hello"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(store.logs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_failure_is_partial_not_fatal() {
        let store = Arc::new(TrapStore {
            fail_history: true,
            ..TrapStore::default()
        });
        let (pipeline, _dir) = pipeline_with(store, Arc::new(MockMailbox::new()), PipelineConfig::default());

        let outcome = pipeline.run_one(&emails(1)[0]).await.unwrap();

        assert_eq!(outcome.state, EmailState::PartiallyFailed);
        assert_eq!(outcome.actions[0].action_name, ACTION_HISTORY);
        assert_eq!(outcome.actions[0].status, ActionStatus::Failed);
        assert_eq!(outcome.decision.intent, Intent::Summarize);
    }

    #[tokio::test]
    async fn one_panicking_email_does_not_stop_the_batch() {
        for concurrency in [1, 3] {
            let store = Arc::new(TrapStore {
                panic_on: Some("e2".into()),
                ..TrapStore::default()
            });
            let config = PipelineConfig {
                concurrency,
                ..PipelineConfig::default()
            };
            let (pipeline, _dir) = pipeline_with(store, Arc::new(MockMailbox::new()), config);

            let summary = pipeline.run(emails(4), &AtomicBool::new(false)).await;

            assert_eq!(summary.total, 4);
            assert_eq!(summary.processed, 3);
            assert_eq!(summary.failed, 1);
            let failed: Vec<&BatchItem> = summary.items.iter().filter(|i| i.state == EmailState::Failed).collect();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].email_id, "e2");
            assert!(failed[0].error.as_deref().unwrap().contains("storage exploded"));
            assert_eq!(summary.by_intent.get("summarize"), Some(&3));
        }
    }

    #[tokio::test]
    async fn duplicates_skipped_and_cap_enforced() {
        let config = PipelineConfig {
            max_emails_per_run: 2,
            concurrency: 1,
        };
        let (pipeline, _dir) = pipeline_with(Arc::new(TrapStore::default()), Arc::new(MockMailbox::new()), config);
        let mut batch = emails(3);
        batch.insert(1, batch[0].clone());

        let summary = pipeline.run(batch, &AtomicBool::new(false)).await;

        assert_eq!(summary.total, 4);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.capped, 1);
        assert_eq!(summary.processed, 2);
        let ids: HashSet<&str> = summary.items.iter().map(|i| i.email_id.as_str()).collect();
        assert_eq!(ids, HashSet::from(["e1", "e2"]));
    }

    #[tokio::test]
    async fn cancellation_finishes_current_email_then_stops() {
        let cancel = Arc::new(AtomicBool::new(false));
        let store = Arc::new(TrapStore {
            cancel_on: Some(("e2".into(), cancel.clone())),
            ..TrapStore::default()
        });
        let (pipeline, _dir) = pipeline_with(store, Arc::new(MockMailbox::new()), PipelineConfig::default());

        let summary = pipeline.run(emails(4), &cancel).await;

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.cancelled, 2);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn run_from_source_uses_fetch() {
        let mailbox = Arc::new(MockMailbox::with_inbox(emails(3)));
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (pipeline, _dir) = pipeline_with(store.clone(), mailbox, PipelineConfig::default());

        let summary = pipeline
            .run_from_source(&FetchFilter::Unseen, 10, &AtomicBool::new(false))
            .await
            .unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(store.history(10).await.unwrap().len(), 3);
        assert!(!store.workflow_logs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_is_an_error() {
        let mailbox = Arc::new(MockMailbox::new());
        mailbox.fail_fetches(true);
        let (pipeline, _dir) = pipeline_with(Arc::new(TrapStore::default()), mailbox, PipelineConfig::default());

        let err = pipeline
            .run_from_source(&FetchFilter::Unseen, 5, &AtomicBool::new(false))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(_)));
    }

    #[test]
    fn summary_counts_partial_failures_as_processed() {
        let mut summary = BatchSummary::default();
        summary.record(BatchItem {
            email_id: "a".into(),
            state: EmailState::PartiallyFailed,
            decision: Some(Decision::safe_default("x")),
            actions: Vec::new(),
            error: None,
        });
        summary.record(BatchItem::failed("b", "boom"));

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.partially_failed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.by_intent.get("ignore"), Some(&1));
    }
}
