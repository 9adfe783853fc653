//! In-process mailbox used when no IMAP host is configured, and in tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::channels::{EmailSource, FetchFilter};
use crate::error::ConnectorError;
use crate::pipeline::types::Email;

/// A reply handed to `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReply {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Deterministic mailbox.
///
/// With no inbox it synthesizes `mock_N` project-update requests. With an
/// inbox, `Unseen` returns each message once and `Search` returns all.
#[derive(Default)]
pub struct MockMailbox {
    inbox: Option<Vec<Email>>,
    seen: Mutex<HashSet<String>>,
    sent: Mutex<Vec<SentReply>>,
    fail_sends: AtomicBool,
    fail_fetches: AtomicBool,
}

impl MockMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inbox(inbox: Vec<Email>) -> Self {
        Self {
            inbox: Some(inbox),
            ..Self::default()
        }
    }

    /// Make every subsequent `send` fail with `SendFailed`.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `fetch` fail with `Unreachable`.
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Replies sent so far, in order.
    pub fn sent(&self) -> Vec<SentReply> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Sample request used when the mailbox has no inbox.
pub fn sample_email(n: usize) -> Email {
    Email::new(
        format!("mock_{n}"),
        format!("client{n}@example.com"),
        format!("Request for Project Update - Email {n}"),
        format!(
            "Hi, I need an update on the project status. Can you provide a summary? \
             This is mock email {n}."
        ),
    )
}

#[async_trait]
impl EmailSource for MockMailbox {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(&self, filter: &FetchFilter, max_count: usize) -> Result<Vec<Email>, ConnectorError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(ConnectorError::Unreachable {
                name: self.name().into(),
                reason: "mock mailbox configured to fail".into(),
            });
        }

        let Some(inbox) = &self.inbox else {
            let emails: Vec<Email> = (1..=max_count).map(sample_email).collect();
            info!(count = emails.len(), "Generated mock emails");
            return Ok(emails);
        };

        let mut seen = self.seen.lock().map_err(|_| ConnectorError::Unreachable {
            name: self.name().into(),
            reason: "mailbox state poisoned".into(),
        })?;
        let emails: Vec<Email> = inbox
            .iter()
            .filter(|e| *filter != FetchFilter::Unseen || !seen.contains(&e.email_id))
            .take(max_count)
            .cloned()
            .collect();
        if *filter == FetchFilter::Unseen {
            seen.extend(emails.iter().map(|e| e.email_id.clone()));
        }
        Ok(emails)
    }

    async fn send(&self, reply_to: &str, subject: &str, body: &str) -> Result<(), ConnectorError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ConnectorError::SendFailed {
                name: self.name().into(),
                reason: format!("refusing to send to {reply_to}"),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentReply {
                to: reply_to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        }
        info!(to = reply_to, subject, "Mock reply recorded");
        Ok(())
    }
}
