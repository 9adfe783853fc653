//! Decision Engine: email in, `Decision` out.
//!
//! `classify` never fails. Provider errors, timeouts and unparseable output
//! all resolve to a keyword-heuristic decision, and urgent keywords always
//! escalate priority last.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::DecisionConfig;
use crate::llm::provider::LlmProvider;
use crate::llm::retry::{RetryPolicy, complete_with_retry, complete_with_timeout};
use crate::pipeline::heuristics::{self, ENTITY_CLIENT_NAME, ENTITY_URGENCY, KeywordHeuristics};
use crate::pipeline::prompts::{classify_request, reply_request, template_reply};
use crate::pipeline::types::{Decision, DecisionSource, Email, Intent, Priority};

/// Confidence assumed when a model omits the field.
const DEFAULT_MODEL_CONFIDENCE: f32 = 0.8;

/// Confidence of a heuristic decision made after the provider failed.
/// Below the default gate, so fallbacks never trigger primary actions.
pub const FALLBACK_CONFIDENCE: f32 = 0.3;

pub struct DecisionEngine {
    provider: Arc<dyn LlmProvider>,
    heuristics: KeywordHeuristics,
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(provider: Arc<dyn LlmProvider>, config: DecisionConfig) -> Self {
        Self {
            provider,
            heuristics: KeywordHeuristics::new(&config.urgent_keywords),
            config,
        }
    }

    pub fn heuristics(&self) -> &KeywordHeuristics {
        &self.heuristics
    }

    /// True when the provider is the network-free heuristic substitute.
    pub fn is_mock(&self) -> bool {
        !self.provider.is_live()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.retry_attempts.max(1),
            base_delay: self.config.retry_base_delay,
            timeout: self.config.llm_timeout,
            ..RetryPolicy::default()
        }
    }

    /// Classify one email. Always returns an in-domain decision.
    pub async fn classify(&self, email: &Email) -> Decision {
        let request = classify_request(email, &self.config);
        let policy = self.retry_policy();
        let source = if self.provider.is_live() {
            DecisionSource::Model
        } else {
            DecisionSource::Heuristic
        };

        let mut last_failure = String::from("no attempt made");
        for attempt in 1..=policy.max_attempts {
            match complete_with_timeout(self.provider.as_ref(), request.clone(), policy.timeout).await {
                Ok(response) => match parse_decision(&response.content, source) {
                    Ok(decision) => {
                        debug!(
                            email_id = %email.email_id,
                            attempt,
                            intent = %decision.intent,
                            priority = %decision.priority,
                            "Parsed provider decision"
                        );
                        return self.finalize(email, decision);
                    }
                    Err(reason) => {
                        warn!(email_id = %email.email_id, attempt, %reason, "Unusable provider output");
                        last_failure = reason;
                    }
                },
                Err(e) if e.is_fatal() => {
                    warn!(email_id = %email.email_id, error = %e, "Provider call failed, not retrying");
                    last_failure = e.to_string();
                    break;
                }
                Err(e) => {
                    warn!(email_id = %email.email_id, attempt, error = %e, "Provider call failed");
                    last_failure = e.to_string();
                }
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
        }

        info!(email_id = %email.email_id, reason = %last_failure, "Falling back to keyword heuristics");
        self.fallback(email, &last_failure)
    }

    /// Heuristic decision used after the provider failed.
    pub fn fallback(&self, email: &Email, reason: &str) -> Decision {
        let verdict = self.heuristics.classify(email);
        if verdict.intent == Intent::Ignore && verdict.priority == Priority::Low {
            let mut decision = Decision::safe_default(format!("Provider unavailable ({reason})"));
            decision.entities = verdict.entities;
            return decision;
        }
        let decision = Decision {
            intent: verdict.intent,
            priority: verdict.priority,
            entities: verdict.entities,
            confidence: FALLBACK_CONFIDENCE,
            reasoning: format!("Heuristic fallback ({reason}): {}", verdict.reasoning),
            source: DecisionSource::Fallback,
            created_at: Utc::now(),
        };
        self.finalize(email, decision)
    }

    /// Apply urgent-keyword escalation. Only ever raises priority.
    fn finalize(&self, email: &Email, mut decision: Decision) -> Decision {
        let matched = self.heuristics.urgent_matches(email);
        if matched.is_empty() {
            return decision;
        }
        if decision.priority != Priority::Urgent {
            debug!(
                email_id = %email.email_id,
                from = %decision.priority,
                keywords = %matched.join(", "),
                "Escalating priority on urgent keyword"
            );
            decision.priority = Priority::Urgent;
        }
        decision
            .entities
            .entry(ENTITY_URGENCY.to_string())
            .or_insert_with(|| matched.join(", "));
        decision
    }

    /// Reply text for a `reply` decision; template on any failure.
    pub async fn compose_reply(&self, email: &Email, decision: &Decision) -> String {
        let client = decision
            .entity(ENTITY_CLIENT_NAME)
            .map(str::to_string)
            .or_else(|| heuristics::client_name(email))
            .unwrap_or_default();
        let request = reply_request(email, decision, &client, &self.config);
        match complete_with_retry(self.provider.as_ref(), &request, &self.retry_policy()).await {
            Ok(response) if !response.content.trim().is_empty() => response.content.trim().to_string(),
            Ok(_) => {
                warn!(email_id = %email.email_id, "Empty reply from provider, using template");
                template_reply(&client, &email.subject)
            }
            Err(e) => {
                warn!(email_id = %email.email_id, error = %e, "Reply generation failed, using template");
                template_reply(&client, &email.subject)
            }
        }
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// Parse provider text into a decision, coercing each field independently.
///
/// Fails only when no JSON object carrying `intent` or `priority` exists.
pub fn parse_decision(raw: &str, source: DecisionSource) -> Result<Decision, String> {
    let object = find_decision_object(raw).ok_or_else(|| {
        let preview: String = raw.chars().take(80).collect();
        format!("no decision object in response: {preview:?}")
    })?;

    let intent = match object.get("intent") {
        Some(Value::String(s)) => Intent::parse(s).unwrap_or_else(|| {
            warn!(intent = %s, "Invalid intent, defaulting to ignore");
            Intent::Ignore
        }),
        _ => Intent::Ignore,
    };
    let priority = match object.get("priority") {
        Some(Value::String(s)) => Priority::parse(s).unwrap_or_else(|| {
            warn!(priority = %s, "Invalid priority, defaulting to low");
            Priority::Low
        }),
        _ => Priority::Low,
    };

    Ok(Decision {
        intent,
        priority,
        entities: object
            .get("entities")
            .and_then(Value::as_object)
            .map(coerce_entities)
            .unwrap_or_default(),
        confidence: coerce_confidence(object.get("confidence")),
        reasoning: object
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        source,
        created_at: Utc::now(),
    })
}

/// First syntactically valid JSON object in `text` that looks like a decision.
///
/// Handles commentary before or after the object and markdown fences.
fn find_decision_object(text: &str) -> Option<Map<String, Value>> {
    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next()
            && (map.contains_key("intent") || map.contains_key("priority"))
        {
            return Some(map);
        }
    }
    None
}

fn coerce_confidence(value: Option<&Value>) -> f32 {
    let raw = match value {
        None | Some(Value::Null) => return DEFAULT_MODEL_CONFIDENCE,
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match raw {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0) as f32,
        _ => 0.0,
    }
}

fn coerce_entities(raw: &Map<String, Value>) -> BTreeMap<String, String> {
    raw.iter()
        .filter_map(|(key, value)| coerce_entity(value).map(|v| (key.clone(), v)))
        .collect()
}

fn coerce_entity(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(coerce_entity)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null | Value::Object(_) => return None,
    };
    let lowered = text.to_lowercase();
    (!text.is_empty() && lowered != "null" && lowered != "none").then_some(text)
}
