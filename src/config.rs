//! Configuration types.
//!
//! Everything is an explicit value handed to the components at
//! construction; components never read the process environment. Logging
//! (`RUST_LOG`, `MAIL_TRIAGE_LOG_DIR`) is set up in `main` before this loads.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::email::EmailConfig;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::pipeline::heuristics::DEFAULT_URGENT_KEYWORDS;

/// Decision Engine settings.
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// Keywords that force `urgent` priority and drive the heuristics.
    pub urgent_keywords: Vec<String>,
    /// Provider attempts per classification, including the first.
    pub retry_attempts: u32,
    /// Timeout for a single provider call.
    pub llm_timeout: Duration,
    /// Delay before the second attempt; doubles per retry.
    pub retry_base_delay: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            urgent_keywords: DEFAULT_URGENT_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            retry_attempts: 3,
            llm_timeout: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(500),
            temperature: 0.3,
            max_tokens: 1000,
        }
    }
}

/// Workflow Executor settings.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Primary actions are skipped below this confidence.
    pub confidence_threshold: f32,
    pub auto_reply_enabled: bool,
    pub auto_task_enabled: bool,
    pub save_attachments_enabled: bool,
    /// Timeout for a single send through the email source.
    pub send_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            auto_reply_enabled: true,
            auto_task_enabled: true,
            save_attachments_enabled: true,
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// Pipeline Coordinator settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Emails processed per run; the rest are reported as capped.
    pub max_emails_per_run: usize,
    /// Emails in flight at once. 1 means sequential.
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_emails_per_run: 10,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub attachments_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mail-triage.db"),
            attachments_dir: PathBuf::from("./data/attachments"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub decision: DecisionConfig,
    pub workflow: WorkflowConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    /// `None` when no IMAP host is configured; the mock mailbox is used.
    pub mailbox: Option<EmailConfig>,
}

impl AppConfig {
    /// Build and validate configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend = match get("MAIL_TRIAGE_LLM_BACKEND").as_deref() {
            None | Some("anthropic") => LlmBackend::Anthropic,
            Some("openai") => LlmBackend::OpenAi,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "MAIL_TRIAGE_LLM_BACKEND".into(),
                    message: format!("unknown backend '{other}' (expected anthropic or openai)"),
                });
            }
        };
        let key_var = match backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        let api_key = get(key_var).map(SecretString::from);
        let mock_mode = match get("MAIL_TRIAGE_MOCK_MODE") {
            Some(raw) => parse_bool("MAIL_TRIAGE_MOCK_MODE", &raw)?,
            None => api_key.is_none(),
        };
        if !mock_mode && api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: key_var.into(),
                hint: "Set the API key or MAIL_TRIAGE_MOCK_MODE=true".into(),
            });
        }
        let llm = LlmConfig {
            backend,
            api_key,
            model: get("MAIL_TRIAGE_MODEL").unwrap_or_else(|| backend.default_model().to_string()),
            mock_mode,
        };

        let defaults = DecisionConfig::default();
        let decision = DecisionConfig {
            urgent_keywords: match get("MAIL_TRIAGE_URGENT_KEYWORDS") {
                Some(raw) => raw
                    .split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
                None => defaults.urgent_keywords,
            },
            retry_attempts: parse_or(&get, "MAIL_TRIAGE_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            llm_timeout: Duration::from_secs(parse_or(
                &get,
                "MAIL_TRIAGE_LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )?),
            retry_base_delay: defaults.retry_base_delay,
            temperature: parse_or(&get, "MAIL_TRIAGE_TEMPERATURE", defaults.temperature)?,
            max_tokens: parse_or(&get, "MAIL_TRIAGE_MAX_TOKENS", defaults.max_tokens)?,
        };

        let defaults = WorkflowConfig::default();
        let workflow = WorkflowConfig {
            confidence_threshold: parse_or(
                &get,
                "MAIL_TRIAGE_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            )?,
            auto_reply_enabled: bool_or(&get, "MAIL_TRIAGE_AUTO_REPLY", defaults.auto_reply_enabled)?,
            auto_task_enabled: bool_or(&get, "MAIL_TRIAGE_AUTO_TASK", defaults.auto_task_enabled)?,
            save_attachments_enabled: bool_or(
                &get,
                "MAIL_TRIAGE_SAVE_ATTACHMENTS",
                defaults.save_attachments_enabled,
            )?,
            send_timeout: Duration::from_secs(parse_or(
                &get,
                "MAIL_TRIAGE_SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            max_emails_per_run: parse_or(
                &get,
                "MAIL_TRIAGE_MAX_EMAILS_PER_RUN",
                defaults.max_emails_per_run,
            )?,
            concurrency: parse_or(&get, "MAIL_TRIAGE_CONCURRENCY", defaults.concurrency)?,
        };

        let defaults = StorageConfig::default();
        let storage = StorageConfig {
            db_path: get("MAIL_TRIAGE_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            attachments_dir: get("MAIL_TRIAGE_ATTACHMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.attachments_dir),
        };

        let server = ServerConfig {
            port: parse_or(&get, "MAIL_TRIAGE_PORT", ServerConfig::default().port)?,
        };

        let config = Self {
            llm,
            decision,
            workflow,
            pipeline,
            storage,
            server,
            mailbox: EmailConfig::from_lookup(&get)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Range checks that parsing alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };
        let threshold = self.workflow.confidence_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(invalid("MAIL_TRIAGE_CONFIDENCE_THRESHOLD", "must be within [0, 1]"));
        }
        if self.pipeline.max_emails_per_run == 0 {
            return Err(invalid("MAIL_TRIAGE_MAX_EMAILS_PER_RUN", "must be at least 1"));
        }
        if self.pipeline.concurrency == 0 {
            return Err(invalid("MAIL_TRIAGE_CONCURRENCY", "must be at least 1"));
        }
        if self.decision.retry_attempts == 0 {
            return Err(invalid("MAIL_TRIAGE_RETRY_ATTEMPTS", "must be at least 1"));
        }
        let temperature = self.decision.temperature;
        if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
            return Err(invalid("MAIL_TRIAGE_TEMPERATURE", "must be within [0, 2]"));
        }
        if self.decision.max_tokens == 0 {
            return Err(invalid("MAIL_TRIAGE_MAX_TOKENS", "must be at least 1"));
        }
        if self.decision.llm_timeout.is_zero() || self.workflow.send_timeout.is_zero() {
            return Err(invalid("MAIL_TRIAGE_*_TIMEOUT_SECS", "must be at least 1 second"));
        }
        Ok(())
    }
}

pub(crate) fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

fn bool_or<F>(get: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_bool(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' is not a boolean"),
        }),
    }
}
