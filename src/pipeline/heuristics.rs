//! Deterministic keyword heuristics.
//!
//! Used three ways:
//! - mock mode: the whole decision comes from here
//! - fallback: when the provider fails or returns nothing parseable
//! - escalation: any configured urgent keyword raises priority to `urgent`,
//!   whatever the model said

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::pipeline::types::{Email, Intent, Priority};

pub const DEFAULT_URGENT_KEYWORDS: [&str; 5] =
    ["urgent", "asap", "immediately", "critical", "emergency"];

pub const ENTITY_CLIENT_NAME: &str = "client_name";
pub const ENTITY_REQUEST_TYPE: &str = "request_type";
pub const ENTITY_DEADLINE: &str = "deadline";
pub const ENTITY_URGENCY: &str = "urgency_indicators";

static MEETING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(meeting|meet|call|schedule|scheduling|calendar)\b").unwrap()
});

static UPDATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(update|updates|status|progress|report)\b").unwrap()
});

static QUESTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\?|\b(question|help|support|can you|could you|would you|please|need)\b)")
        .unwrap()
});

const DATE_WORDS: &str = r"(monday|tuesday|wednesday|thursday|friday|saturday|sunday|today|tomorrow|tonight|eod|eow|end of (?:the )?(?:day|week|month)|next week|\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}(?:/\d{2,4})?|(?:jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]* \d{1,2}(?:st|nd|rd|th)?)";

static DEADLINE_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdeadline\s*(?:is|:|-)\s*([^\n.,;!?]+)").unwrap());

static DEADLINE_BY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b(?:by|due(?:\s+(?:on|by))?|before)\s+{DATE_WORDS}\b")).unwrap()
});

/// Keyword family a message matched, in rule order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFamily {
    Meeting,
    StatusUpdate,
    Question,
    UrgentOnly,
    Unmatched,
}

impl RequestFamily {
    pub fn request_type(&self) -> Option<&'static str> {
        match self {
            Self::Meeting => Some("meeting_request"),
            Self::StatusUpdate => Some("status_update"),
            Self::Question => Some("support_request"),
            Self::UrgentOnly => Some("urgent_request"),
            Self::Unmatched => None,
        }
    }
}

/// Output of the keyword rules for one email.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicVerdict {
    pub family: RequestFamily,
    pub intent: Intent,
    pub priority: Priority,
    pub entities: BTreeMap<String, String>,
    pub reasoning: String,
}

struct UrgentKeyword {
    keyword: String,
    regex: Regex,
}

/// Keyword rules parameterized by the configured urgent keyword set.
pub struct KeywordHeuristics {
    urgent: Vec<UrgentKeyword>,
}

impl KeywordHeuristics {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut urgent = Vec::new();
        for raw in keywords {
            let keyword = raw.as_ref().trim().to_lowercase();
            if keyword.is_empty() || urgent.iter().any(|u: &UrgentKeyword| u.keyword == keyword) {
                continue;
            }
            match keyword_regex(&keyword) {
                Ok(regex) => urgent.push(UrgentKeyword { keyword, regex }),
                Err(e) => warn!(keyword = %keyword, error = %e, "Skipping urgent keyword"),
            }
        }
        Self { urgent }
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.urgent.iter().map(|u| u.keyword.as_str())
    }

    /// Urgent keywords present in subject or body, in configured order.
    pub fn urgent_matches(&self, email: &Email) -> Vec<&str> {
        self.urgent
            .iter()
            .filter(|u| mentions(&u.regex, email))
            .map(|u| u.keyword.as_str())
            .collect()
    }

    /// Raise `priority` to urgent if any keyword is present. Never lowers.
    pub fn escalate(&self, priority: Priority, email: &Email) -> Priority {
        if self.urgent_matches(email).is_empty() {
            priority
        } else {
            priority.max(Priority::Urgent)
        }
    }

    pub fn family(&self, email: &Email) -> RequestFamily {
        if mentions(&MEETING_RE, email) {
            RequestFamily::Meeting
        } else if mentions(&UPDATE_RE, email) {
            RequestFamily::StatusUpdate
        } else if mentions(&QUESTION_RE, email) {
            RequestFamily::Question
        } else if !self.urgent_matches(email).is_empty() {
            RequestFamily::UrgentOnly
        } else {
            RequestFamily::Unmatched
        }
    }

    /// Classify by keywords alone.
    pub fn classify(&self, email: &Email) -> HeuristicVerdict {
        let family = self.family(email);
        let (intent, base_priority) = match family {
            RequestFamily::Meeting => (Intent::CreateTask, Priority::High),
            RequestFamily::StatusUpdate => (Intent::Summarize, Priority::Medium),
            RequestFamily::Question => (Intent::Reply, Priority::Medium),
            RequestFamily::UrgentOnly => (Intent::Reply, Priority::Urgent),
            RequestFamily::Unmatched => (Intent::Ignore, Priority::Low),
        };
        let priority = self.escalate(base_priority, email);
        let entities = self.extract_entities(email, family);
        let reasoning = match family {
            RequestFamily::Unmatched => "No actionable keywords found".to_string(),
            _ => format!(
                "Keyword match ({}) suggests {intent} at {priority} priority",
                family.request_type().unwrap_or("none")
            ),
        };
        HeuristicVerdict {
            family,
            intent,
            priority,
            entities,
            reasoning,
        }
    }

    pub fn extract_entities(&self, email: &Email, family: RequestFamily) -> BTreeMap<String, String> {
        let mut entities = BTreeMap::new();
        if let Some(name) = client_name(email) {
            entities.insert(ENTITY_CLIENT_NAME.to_string(), name);
        }
        if let Some(kind) = family.request_type() {
            entities.insert(ENTITY_REQUEST_TYPE.to_string(), kind.to_string());
        }
        if let Some(deadline) = extract_deadline(&email.subject).or_else(|| extract_deadline(&email.body)) {
            entities.insert(ENTITY_DEADLINE.to_string(), deadline);
        }
        let urgent = self.urgent_matches(email);
        if !urgent.is_empty() {
            entities.insert(ENTITY_URGENCY.to_string(), urgent.join(", "));
        }
        entities
    }
}

impl Default for KeywordHeuristics {
    fn default() -> Self {
        Self::new(DEFAULT_URGENT_KEYWORDS)
    }
}

fn mentions(re: &Regex, email: &Email) -> bool {
    re.is_match(&email.subject) || re.is_match(&email.body)
}

fn keyword_regex(keyword: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(keyword);
    let word = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_');
    let lead = if word(keyword.chars().next()) { r"\b" } else { "" };
    let tail = if word(keyword.chars().last()) { r"\b" } else { "" };
    Regex::new(&format!("(?i){lead}{escaped}{tail}"))
}

/// Display name if present, else the titlecased local part
/// (`john.doe@x.com` becomes `John Doe`).
pub fn client_name(email: &Email) -> Option<String> {
    if let Some(name) = email.display_name() {
        return Some(name.to_string());
    }
    let address = email.reply_address()?;
    let local = address.split('@').next()?;
    let words: Vec<String> = local
        .split(['.', '_', '-', '+'])
        .filter(|w| !w.is_empty())
        .map(titlecase)
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

fn titlecase(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// First deadline phrase found: `deadline: X`, `by Friday`, `due 2024-05-01`.
pub fn extract_deadline(text: &str) -> Option<String> {
    if let Some(caps) = DEADLINE_LABEL_RE.captures(text) {
        let value = caps[1].trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    DEADLINE_BY_RE
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
}
