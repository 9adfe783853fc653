//! Attachment persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::Attachment;

/// Where attachment bytes go. One call per attachment.
#[async_trait]
pub trait AttachmentSink: Send + Sync {
    /// Persist one attachment, returning where it was stored.
    async fn save(&self, email_id: &str, attachment: &Attachment) -> Result<String, DatabaseError>;
}

/// Writes attachments under `<root>/<email_id>/<filename>`.
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Reject names that could escape the email's directory.
pub fn validate_filename(filename: &str) -> Result<(), DatabaseError> {
    let reason = if filename.trim().is_empty() {
        Some("empty filename")
    } else if filename.contains(['/', '\\']) {
        Some("filename contains a path separator")
    } else if filename.contains("..") {
        Some("filename contains '..'")
    } else if filename.contains('\0') {
        Some("filename contains a NUL byte")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(DatabaseError::Attachment {
            filename: filename.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Directory-safe form of an email id: the sanitized id plus a short
/// digest of the raw id (`<abc@host>` becomes `_abc_host_-1a2b3c4d`), so
/// ids that sanitize alike still get separate directories.
pub fn email_dir_name(email_id: &str) -> String {
    let readable: String = email_id
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, email_id.as_bytes()).simple().to_string();
    format!("{readable}-{}", &digest[..8])
}

#[async_trait]
impl AttachmentSink for AttachmentStore {
    async fn save(&self, email_id: &str, attachment: &Attachment) -> Result<String, DatabaseError> {
        validate_filename(&attachment.filename)?;
        let fail = |reason: String| DatabaseError::Attachment {
            filename: attachment.filename.clone(),
            reason,
        };

        let dir = self.root.join(email_dir_name(email_id));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| fail(format!("create {}: {e}", dir.display())))?;
        let path = dir.join(&attachment.filename);
        tokio::fs::write(&path, &attachment.content)
            .await
            .map_err(|e| fail(format!("write {}: {e}", path.display())))?;

        debug!(email_id, path = %path.display(), bytes = attachment.content.len(), "Attachment saved");
        Ok(path.display().to_string())
    }
}
