//! Error types for mail triage.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors. Fatal at startup, never per email.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Attachment write failed for {filename}: {reason}")]
    Attachment { filename: String, reason: String },
}

/// Email source connector errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Connector {name} unreachable: {reason}")]
    Unreachable { name: String, reason: String },

    #[error("Authentication failed for connector {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Failed to send on connector {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Connector {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Invalid message from connector {name}: {reason}")]
    InvalidMessage { name: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} rejected a malformed request: {reason}")]
    MalformedRequest { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} is not configured: {reason}")]
    NotConfigured { provider: String, reason: String },
}

impl LlmError {
    /// Transient failures worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. }
                | Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::InvalidResponse { .. }
        )
    }

    /// Failures that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed { .. } | Self::MalformedRequest { .. } | Self::NotConfigured { .. }
        )
    }
}

/// Malformed email input, rejected before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("sender is empty")]
    EmptySender,

    #[error("sender '{0}' is not an email address")]
    InvalidSender(String),

    #[error("email_id is empty")]
    EmptyId,

    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
}

/// Pipeline-level errors for one email or one run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid email: {0}")]
    Validation(#[from] ValidationError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] ConnectorError),

    #[error("Email {email_id} processing panicked: {reason}")]
    Panicked { email_id: String, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_llm_errors_are_retryable() {
        let timeout = LlmError::Timeout {
            provider: "anthropic".into(),
            timeout: Duration::from_secs(30),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_fatal());

        let limited = LlmError::RateLimited {
            provider: "openai".into(),
        };
        assert!(limited.is_retryable());
    }

    #[test]
    fn auth_and_malformed_requests_are_fatal() {
        let auth = LlmError::AuthFailed {
            provider: "anthropic".into(),
        };
        assert!(auth.is_fatal());
        assert!(!auth.is_retryable());

        let bad = LlmError::MalformedRequest {
            provider: "anthropic".into(),
            reason: "400 invalid max_tokens".into(),
        };
        assert!(bad.is_fatal());
        assert!(!bad.is_retryable());
    }

    #[test]
    fn validation_error_converts_into_pipeline_error() {
        let err: PipelineError = ValidationError::EmptySender.into();
        assert!(err.to_string().contains("sender is empty"));
    }
}
