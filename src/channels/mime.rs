//! RFC 822 message → `Email`.

use chrono::{DateTime, NaiveDate, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use uuid::Uuid;

use crate::pipeline::types::{Attachment, Email};

/// Parse a raw message. `None` when the bytes are not a message at all.
pub fn parse_message(raw: &[u8]) -> Option<Email> {
    let parsed = MessageParser::default().parse(raw)?;

    let email_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));
    let subject = parsed.subject().unwrap_or_default().to_string();
    let body = extract_text(&parsed);
    let attachments = parsed
        .attachments()
        .map(|part| {
            let name = part.attachment_name().unwrap_or("attachment").to_string();
            let mut attachment = Attachment::new(name, part.contents().to_vec());
            if let Some(ct) = part.content_type() {
                let mime = match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_string(),
                };
                attachment = attachment.with_mime_type(mime);
            }
            attachment
        })
        .collect();

    let mut email = Email::new(email_id, extract_sender(&parsed), subject, body).with_attachments(attachments);
    if let Some(received_at) = parsed.date().and_then(to_utc) {
        email.received_at = received_at;
    }
    Some(email)
}

/// `Name <addr>` when the From header has a display name, else the address.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    let Some(addr) = parsed.from().and_then(|a| a.first()) else {
        return String::new();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) if !name.trim().is_empty() => format!("{name} <{address}>"),
        (_, Some(address)) => address.to_string(),
        _ => String::new(),
    }
}

/// Plain text body, falling back to tag-stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Drop tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn to_utc(d: &mail_parser::DateTime) -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))?
        .and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))?;
    Some(naive.and_utc())
}
