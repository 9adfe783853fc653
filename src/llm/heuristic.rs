//! Network-free provider used in mock mode.
//!
//! Answers the same requests as a live model, but synthesizes the response
//! from keyword heuristics, so the rest of the pipeline runs unchanged
//! without credentials.

use async_trait::async_trait;
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider, TASK_KEY, TASK_REPLY};
use crate::pipeline::heuristics::{self, KeywordHeuristics};
use crate::pipeline::prompts::{PromptFields, template_reply};
use crate::pipeline::types::Email;

/// Confidence reported for mock-mode classifications.
pub const HEURISTIC_CONFIDENCE: f32 = 0.7;

pub struct HeuristicProvider {
    heuristics: KeywordHeuristics,
}

impl HeuristicProvider {
    pub fn new(heuristics: KeywordHeuristics) -> Self {
        Self { heuristics }
    }
}

#[async_trait]
impl LlmProvider for HeuristicProvider {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn model_name(&self) -> &str {
        "keyword-heuristics"
    }

    fn is_live(&self) -> bool {
        false
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let fields = PromptFields::from_request(&request).ok_or_else(|| LlmError::MalformedRequest {
            provider: self.name().to_string(),
            reason: "request has no user message".into(),
        })?;

        if request.metadata.get(TASK_KEY).map(String::as_str) == Some(TASK_REPLY) {
            let email = Email::new("prompt", fields.sender.clone(), fields.subject.clone(), "");
            let client = fields
                .client
                .clone()
                .or_else(|| heuristics::client_name(&email))
                .unwrap_or_default();
            return Ok(CompletionResponse {
                content: template_reply(&client, &fields.subject),
            });
        }

        let email = Email::new("prompt", fields.sender, fields.subject, fields.body);
        let verdict = self.heuristics.classify(&email);
        debug!(intent = %verdict.intent, priority = %verdict.priority, "Heuristic classification");

        let content = serde_json::json!({
            "intent": verdict.intent,
            "priority": verdict.priority,
            "entities": verdict.entities,
            "confidence": HEURISTIC_CONFIDENCE,
            "reasoning": format!("Mock analysis: {}", verdict.reasoning),
        })
        .to_string();
        Ok(CompletionResponse { content })
    }
}
