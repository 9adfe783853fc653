//! Email source connectors.
//!
//! The pipeline only sees `EmailSource`: fetch a bounded batch, send a
//! reply. Transport and auth problems surface as `ConnectorError`, never
//! as an empty success.

pub mod email;
pub mod mime;
pub mod mock;

use async_trait::async_trait;

use crate::error::ConnectorError;
use crate::pipeline::types::Email;

pub use email::{EmailConfig, ImapMailbox};
pub use mock::MockMailbox;

/// Which messages a fetch selects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FetchFilter {
    /// Messages not yet marked seen.
    #[default]
    Unseen,
    /// Raw IMAP SEARCH criteria, e.g. `FROM "boss@example.com" SINCE 1-Jan-2025`.
    Search(String),
}

impl FetchFilter {
    /// IMAP SEARCH criteria for this filter.
    pub fn criteria(&self) -> &str {
        match self {
            Self::Unseen => "UNSEEN",
            Self::Search(raw) => raw.trim(),
        }
    }
}

/// A mailbox the pipeline reads from and replies through.
#[async_trait]
pub trait EmailSource: Send + Sync {
    /// Short name for logs (`imap`, `mock`).
    fn name(&self) -> &str;

    /// Fetch at most `max_count` messages matching `filter`.
    async fn fetch(&self, filter: &FetchFilter, max_count: usize) -> Result<Vec<Email>, ConnectorError>;

    /// Send a plain-text reply.
    async fn send(&self, reply_to: &str, subject: &str, body: &str) -> Result<(), ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_unseen() {
        assert_eq!(FetchFilter::default().criteria(), "UNSEEN");
        assert_eq!(
            FetchFilter::Search("  FROM \"a@b.com\" ".into()).criteria(),
            "FROM \"a@b.com\""
        );
    }
}
