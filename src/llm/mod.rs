//! LLM integration for mail triage.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//! - **Heuristic**: keyword rules behind the same trait, for mock mode
//!
//! Uses the rig-core crate for HTTP transport and the `RigAdapter` to bridge
//! rig's `CompletionModel` trait to our `LlmProvider` trait.

pub mod heuristic;
pub mod provider;
pub mod retry;
mod rig_adapter;

pub use heuristic::HeuristicProvider;
pub use provider::*;
pub use retry::RetryPolicy;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::LlmError;
use crate::pipeline::heuristics::KeywordHeuristics;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::OpenAi => "gpt-4o-mini",
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: Option<SecretString>,
    pub model: String,
    /// Skip the network entirely and classify with keyword heuristics.
    pub mock_mode: bool,
}

/// Create an LLM provider from configuration.
///
/// Mock mode yields a `HeuristicProvider` built from `heuristics`; otherwise
/// an API key is required.
pub fn create_provider(
    config: &LlmConfig,
    heuristics: KeywordHeuristics,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    if config.mock_mode {
        tracing::info!("Using heuristic provider (mock mode)");
        return Ok(Arc::new(HeuristicProvider::new(heuristics)));
    }
    let api_key = config
        .api_key
        .as_ref()
        .ok_or_else(|| LlmError::NotConfigured {
            provider: config.backend.as_str().to_string(),
            reason: "no API key configured".to_string(),
        })?;
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(api_key, &config.model),
        LlmBackend::OpenAi => create_openai_provider(api_key, &config.model),
    }
}

fn create_anthropic_provider(
    api_key: &SecretString,
    model_name: &str,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(api_key.expose_secret()).map_err(|e| LlmError::NotConfigured {
            provider: "anthropic".to_string(),
            reason: format!("Failed to create Anthropic client: {}", e),
        })?;

    let model = client.completion_model(model_name);
    tracing::info!("Using Anthropic (model: {})", model_name);
    Ok(Arc::new(RigAdapter::new(model, model_name, "anthropic")))
}

fn create_openai_provider(
    api_key: &SecretString,
    model_name: &str,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(api_key.expose_secret()).map_err(|e| LlmError::NotConfigured {
            provider: "openai".to_string(),
            reason: format!("Failed to create OpenAI client: {}", e),
        })?;

    let model = client.completion_model(model_name);
    tracing::info!("Using OpenAI (model: {})", model_name);
    Ok(Arc::new(RigAdapter::new(model, model_name, "openai")))
}
