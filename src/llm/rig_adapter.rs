//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider, Role};

/// Live provider backed by a rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider: provider.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync,
{
    fn name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = render_conversation(&request);
        let mut builder = self.model.completion_request(prompt);
        if let Some(system) = request.system_prompt() {
            builder = builder.preamble(system);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_error(&self.provider, &e.to_string()))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.clone(),
                reason: "empty completion".into(),
            });
        }

        debug!(provider = %self.provider, chars = content.len(), "Completion received");
        Ok(CompletionResponse { content })
    }
}

/// Flatten non-system messages into a single prompt.
fn render_conversation(request: &CompletionRequest) -> String {
    let turns: Vec<&_> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();
    if let [only] = turns.as_slice() {
        return only.content.clone();
    }
    turns
        .iter()
        .map(|m| match m.role {
            Role::Assistant => format!("Assistant: {}", m.content),
            _ => m.content.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Map a transport error message to a typed `LlmError`.
///
/// rig flattens HTTP status into its error text, so classification is by
/// content: auth and 4xx request errors are fatal, the rest transient.
pub(crate) fn classify_error(provider: &str, message: &str) -> LlmError {
    let lower = message.to_lowercase();
    let provider = provider.to_string();
    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("invalid api key")
        || lower.contains("invalid x-api-key")
    {
        LlmError::AuthFailed { provider }
    } else if lower.contains("429") || lower.contains("rate limit") {
        LlmError::RateLimited { provider }
    } else if lower.contains("400")
        || lower.contains("invalid_request")
        || lower.contains("404")
        || lower.contains("422")
    {
        LlmError::MalformedRequest {
            provider,
            reason: message.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider,
            reason: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;

    #[test]
    fn classify_auth_errors() {
        let err = classify_error("anthropic", "HttpError: 401 Unauthorized");
        assert!(matches!(err, LlmError::AuthFailed { .. }));
        let err = classify_error("openai", "ProviderError: Invalid API key provided");
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }

    #[test]
    fn classify_malformed_requests() {
        let err = classify_error("anthropic", "ProviderError: 400 invalid_request_error");
        assert!(err.is_fatal());
    }

    #[test]
    fn classify_transient_errors() {
        assert!(matches!(
            classify_error("anthropic", "429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        let err = classify_error("anthropic", "connection reset by peer");
        assert!(err.is_retryable());
        let err = classify_error("anthropic", "503 overloaded");
        assert!(err.is_retryable());
    }

    #[test]
    fn render_single_user_message_verbatim() {
        let req = CompletionRequest::new(vec![
            ChatMessage::system("sys"),
            ChatMessage::user("From: a@x.com"),
        ]);
        assert_eq!(render_conversation(&req), "From: a@x.com");
    }

    #[test]
    fn render_multi_turn_conversation() {
        let req = CompletionRequest::new(vec![
            ChatMessage::user("one"),
            ChatMessage::assistant("two"),
            ChatMessage::user("three"),
        ]);
        let rendered = render_conversation(&req);
        assert!(rendered.contains("Assistant: two"));
        assert!(rendered.ends_with("three"));
    }
}
