//! Prompt construction for classification and reply generation.
//!
//! The user message uses a small header block (`Key: value` lines), a blank
//! line, then `Body:` and the truncated body. Classify requests also carry
//! the untruncated fields as metadata; `PromptFields::from_request` prefers
//! those, which is how the heuristic provider sees the email in mock mode.

use crate::config::DecisionConfig;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, META_BODY, META_SENDER, META_SUBJECT, TASK_CLASSIFY, TASK_KEY,
    TASK_REPLY,
};
use crate::pipeline::types::{Decision, Email, Intent, Priority};

/// Body characters sent for classification.
pub const CLASSIFY_BODY_CHARS: usize = 1000;

/// Body characters sent for reply generation.
pub const REPLY_BODY_CHARS: usize = 500;

const BODY_MARKER: &str = "Body:\n";

pub fn classify_system_prompt() -> String {
    let intents: Vec<&str> = Intent::ALL.iter().map(Intent::as_str).collect();
    let priorities: Vec<&str> = Priority::ALL.iter().map(Priority::as_str).collect();
    format!(
        "You are an email triage engine. Classify the email and extract entities.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"intent\": \"...\", \"priority\": \"...\", \"entities\": {{\"client_name\": \"...\", \
         \"request_type\": \"...\", \"deadline\": \"...\", \"urgency_indicators\": [\"...\"]}}, \
         \"confidence\": 0.0, \"reasoning\": \"...\"}}\n\n\
         Rules:\n\
         - \"intent\" must be one of: {intents}\n\
         - \"priority\" must be one of: {priorities}\n\
         - \"confidence\" is a number between 0.0 and 1.0\n\
         - request_type examples: project_update, meeting_request, support, general_inquiry\n\
         - Omit entities you cannot find; never invent a deadline\n\
         - \"reasoning\" is one short sentence",
        intents = intents.join(", "),
        priorities = priorities.join(", "),
    )
}

pub fn reply_system_prompt() -> String {
    "You write professional, concise email replies.\n\n\
     The reply must:\n\
     - acknowledge the email\n\
     - address the main request or question\n\
     - stay short and actionable\n\n\
     Reply text only, no subject line or headers."
        .to_string()
}

/// Classification request for one email.
pub fn classify_request(email: &Email, config: &DecisionConfig) -> CompletionRequest {
    let user = render_user_prompt(
        &[("From", email.sender.as_str()), ("Subject", email.subject.as_str())],
        &email.body,
        CLASSIFY_BODY_CHARS,
    );
    CompletionRequest::new(vec![
        ChatMessage::system(classify_system_prompt()),
        ChatMessage::user(user),
    ])
    .with_temperature(config.temperature)
    .with_max_tokens(config.max_tokens)
    .with_metadata(TASK_KEY, TASK_CLASSIFY)
    .with_metadata(META_SENDER, email.sender.as_str())
    .with_metadata(META_SUBJECT, email.subject.as_str())
    .with_metadata(META_BODY, email.body.as_str())
}

/// Reply-generation request, carrying the decision as context.
pub fn reply_request(
    email: &Email,
    decision: &Decision,
    client: &str,
    config: &DecisionConfig,
) -> CompletionRequest {
    let user = render_user_prompt(
        &[
            ("From", email.sender.as_str()),
            ("Subject", email.subject.as_str()),
            ("Intent", decision.intent.as_str()),
            ("Priority", decision.priority.as_str()),
            ("Client", client),
        ],
        &email.body,
        REPLY_BODY_CHARS,
    );
    CompletionRequest::new(vec![
        ChatMessage::system(reply_system_prompt()),
        ChatMessage::user(user),
    ])
    .with_temperature(config.temperature)
    .with_max_tokens(config.max_tokens)
    .with_metadata(TASK_KEY, TASK_REPLY)
}

fn render_user_prompt(headers: &[(&str, &str)], body: &str, max_body: usize) -> String {
    let mut prompt = String::with_capacity(256 + max_body);
    for (key, value) in headers {
        // Header values stay on one line so the block parses back.
        let value = value.replace(['\r', '\n'], " ");
        prompt.push_str(&format!("{key}: {}\n", value.trim()));
    }
    let preview: String = body.chars().take(max_body).collect();
    prompt.push('\n');
    prompt.push_str(BODY_MARKER);
    prompt.push_str(&preview);
    prompt
}

/// Email fields recovered from a rendered user prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptFields {
    pub sender: String,
    pub subject: String,
    pub client: Option<String>,
    pub body: String,
}

impl PromptFields {
    /// Fields for a request: untruncated metadata where present, otherwise
    /// whatever the rendered user prompt carries.
    pub fn from_request(request: &CompletionRequest) -> Option<Self> {
        let mut fields = Self::parse(request.last_user_message()?);
        let meta = |key: &str| request.metadata.get(key).cloned();
        if let Some(sender) = meta(META_SENDER) {
            fields.sender = sender;
        }
        if let Some(subject) = meta(META_SUBJECT) {
            fields.subject = subject;
        }
        if let Some(body) = meta(META_BODY) {
            fields.body = body;
        }
        Some(fields)
    }

    pub fn parse(prompt: &str) -> Self {
        let (head, body) = match prompt.split_once(&format!("\n{BODY_MARKER}")) {
            Some((head, body)) => (head, body),
            None => (prompt, ""),
        };
        let mut fields = Self {
            body: body.to_string(),
            ..Self::default()
        };
        for line in head.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "From" => fields.sender = value,
                "Subject" => fields.subject = value,
                "Client" if !value.is_empty() => fields.client = Some(value),
                _ => {}
            }
        }
        fields
    }
}

/// Reply used in mock mode and whenever generation fails.
pub fn template_reply(client: &str, subject: &str) -> String {
    let client = if client.trim().is_empty() { "there" } else { client.trim() };
    let subject = if subject.trim().is_empty() {
        "your request"
    } else {
        subject.trim()
    };
    format!(
        "Hi {client},\n\n\
         Thank you for your email. I've received your message regarding \"{subject}\".\n\n\
         I'll review this and get back to you shortly. If this is urgent, please don't \
         hesitate to reach out directly.\n\n\
         Best regards,\n\
         Mail Triage"
    )
}
