//! IMAP mailbox: raw IMAP over rustls for fetch, SMTP via lettre for send.
//!
//! Both directions are blocking and run under `spawn_blocking`.

use std::io::{ErrorKind, Read as IoRead, Write as IoWrite};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::channels::mime::parse_message;
use crate::channels::{EmailSource, FetchFilter};
use crate::config::parse_or;
use crate::error::{ConfigError, ConnectorError};
use crate::pipeline::types::Email;

const NAME: &str = "imap";

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from `EMAIL_*` variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// IMAP folder to read, `INBOX` by default.
    pub folder: String,
    /// Socket read timeout for IMAP.
    pub io_timeout: Duration,
}

impl EmailConfig {
    /// `Ok(None)` when `EMAIL_IMAP_HOST` is unset (mock mailbox).
    pub fn from_lookup<F>(get: &F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(imap_host) = get("EMAIL_IMAP_HOST") else {
            return Ok(None);
        };
        let username = get("EMAIL_USERNAME").ok_or_else(|| ConfigError::MissingRequired {
            key: "EMAIL_USERNAME".into(),
            hint: "Required when EMAIL_IMAP_HOST is set".into(),
        })?;

        Ok(Some(Self {
            imap_port: parse_or(get, "EMAIL_IMAP_PORT", 993)?,
            smtp_host: get("EMAIL_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp")),
            smtp_port: parse_or(get, "EMAIL_SMTP_PORT", 587)?,
            password: SecretString::from(get("EMAIL_PASSWORD").unwrap_or_default()),
            from_address: get("EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone()),
            folder: get("EMAIL_FOLDER").unwrap_or_else(|| "INBOX".into()),
            io_timeout: Duration::from_secs(parse_or(get, "EMAIL_IO_TIMEOUT_SECS", 30)?),
            imap_host,
            username,
        }))
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

pub struct ImapMailbox {
    config: Arc<EmailConfig>,
}

impl ImapMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl EmailSource for ImapMailbox {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&self, filter: &FetchFilter, max_count: usize) -> Result<Vec<Email>, ConnectorError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let criteria = filter.criteria().to_string();
        if criteria.is_empty() || criteria.contains(['\r', '\n']) {
            return Err(ConnectorError::InvalidMessage {
                name: NAME.into(),
                reason: format!("unusable search criteria {criteria:?}"),
            });
        }
        let config = Arc::clone(&self.config);
        let raw = tokio::task::spawn_blocking(move || fetch_raw(&config, &criteria, max_count))
            .await
            .map_err(|e| ConnectorError::Unreachable {
                name: NAME.into(),
                reason: format!("fetch task failed: {e}"),
            })??;

        let mut emails = Vec::with_capacity(raw.len());
        for (seq, bytes) in raw {
            match parse_message(&bytes) {
                Some(email) => emails.push(email),
                None => warn!(seq = %seq, bytes = bytes.len(), "Skipping unparseable message"),
            }
        }
        info!(count = emails.len(), folder = %self.config.folder, "Fetched emails");
        Ok(emails)
    }

    async fn send(&self, reply_to: &str, subject: &str, body: &str) -> Result<(), ConnectorError> {
        let config = Arc::clone(&self.config);
        let (to, subject, body) = (reply_to.to_string(), subject.to_string(), body.to_string());
        tokio::task::spawn_blocking(move || send_smtp(&config, &to, &subject, &body))
            .await
            .map_err(|e| send_failed(format!("send task failed: {e}")))??;
        info!(to = reply_to, "Reply sent");
        Ok(())
    }
}

fn send_failed(reason: String) -> ConnectorError {
    ConnectorError::SendFailed {
        name: NAME.into(),
        reason,
    }
}

fn unreachable(reason: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Unreachable {
        name: NAME.into(),
        reason: reason.to_string(),
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

fn send_smtp(config: &EmailConfig, to: &str, subject: &str, body: &str) -> Result<(), ConnectorError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );
    let transport = SmtpTransport::starttls_relay(&config.smtp_host)
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let message = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| send_failed(format!("invalid from address: {e}")))?,
        )
        .to(to.parse().map_err(|e| send_failed(format!("invalid to address: {e}")))?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| send_failed(format!("failed to build email: {e}")))?;

    transport
        .send(&message)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
    Ok(())
}

// ── IMAP ────────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Minimal tagged-command IMAP session.
struct ImapSession {
    stream: TlsStream,
    next_tag: u32,
    timeout: Duration,
}

impl ImapSession {
    fn connect(config: &EmailConfig) -> Result<Self, ConnectorError> {
        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))
            .map_err(|e| unreachable(format!("connect {}:{}: {e}", config.imap_host, config.imap_port)))?;
        tcp.set_read_timeout(Some(config.io_timeout)).map_err(unreachable)?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| unreachable(format!("invalid host name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(unreachable)?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
            timeout: config.io_timeout,
        };
        let greeting = session.read_line()?;
        debug!(greeting = %String::from_utf8_lossy(&greeting).trim_end(), "IMAP connected");
        Ok(session)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, ConnectorError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match IoRead::read(&mut self.stream, &mut byte) {
                Ok(0) => return Err(unreachable("IMAP connection closed")),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(ConnectorError::Timeout {
                        name: NAME.into(),
                        timeout: self.timeout,
                    });
                }
                Err(e) => return Err(unreachable(e)),
            }
        }
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, ConnectorError> {
        let mut buf = vec![0u8; len];
        IoRead::read_exact(&mut self.stream, &mut buf).map_err(unreachable)?;
        Ok(buf)
    }

    /// Send one command and collect its response. Literals (`{n}`) are
    /// read verbatim into `literals`.
    fn command(&mut self, cmd: &str) -> Result<Response, ConnectorError> {
        let tag = format!("A{} ", self.next_tag);
        self.next_tag += 1;
        IoWrite::write_all(&mut self.stream, format!("{tag}{cmd}\r\n").as_bytes()).map_err(unreachable)?;
        IoWrite::flush(&mut self.stream).map_err(unreachable)?;

        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            let text = String::from_utf8_lossy(&line).to_string();
            if let Some(len) = literal_len(&text) {
                response.literals.push(self.read_exact(len)?);
            }
            if let Some(status) = text.strip_prefix(&tag) {
                response.ok = status.trim_start().starts_with("OK");
                response.status = status.trim().to_string();
                return Ok(response);
            }
            response.untagged.push(text);
        }
    }
}

#[derive(Debug, Default)]
struct Response {
    ok: bool,
    status: String,
    untagged: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// Byte count of a trailing `{n}` literal marker.
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.trim_end().strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].parse().ok()
}

/// Sequence numbers from `* SEARCH` lines.
fn search_results(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect()
}

/// IMAP quoted string.
fn quote(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Fetch raw RFC 822 bytes for up to `max_count` matches, marking each seen.
fn fetch_raw(
    config: &EmailConfig,
    criteria: &str,
    max_count: usize,
) -> Result<Vec<(String, Vec<u8>)>, ConnectorError> {
    let mut session = ImapSession::connect(config)?;

    let login = session.command(&format!(
        "LOGIN {} {}",
        quote(&config.username),
        quote(config.password.expose_secret())
    ))?;
    if !login.ok {
        return Err(ConnectorError::AuthFailed {
            name: NAME.into(),
            reason: login.status,
        });
    }

    let select = session.command(&format!("SELECT {}", quote(&config.folder)))?;
    if !select.ok {
        return Err(unreachable(format!("SELECT {} failed: {}", config.folder, select.status)));
    }

    let search = session.command(&format!("SEARCH {criteria}"))?;
    if !search.ok {
        return Err(ConnectorError::InvalidMessage {
            name: NAME.into(),
            reason: format!("SEARCH {criteria} rejected: {}", search.status),
        });
    }

    let mut results = Vec::new();
    for seq in search_results(&search.untagged).into_iter().take(max_count) {
        let fetched = session.command(&format!("FETCH {seq} RFC822"))?;
        match fetched.literals.into_iter().next() {
            Some(bytes) if fetched.ok => results.push((seq.clone(), bytes)),
            _ => warn!(seq = %seq, status = %fetched.status, "FETCH returned no message"),
        }
        if let Err(e) = session.command(&format!("STORE {seq} +FLAGS (\\Seen)")) {
            warn!(seq = %seq, error = %e, "Failed to mark message seen");
        }
    }

    let _ = session.command("LOGOUT");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| env.get(key).cloned()
    }

    #[test]
    fn no_imap_host_means_no_mailbox() {
        assert!(EmailConfig::from_lookup(&lookup(&[])).unwrap().is_none());
    }

    #[test]
    fn defaults_derive_from_imap_host_and_username() {
        let get = lookup(&[
            ("EMAIL_IMAP_HOST", "imap.example.com"),
            ("EMAIL_USERNAME", "me@example.com"),
            ("EMAIL_PASSWORD", "hunter2"),
        ]);
        let config = EmailConfig::from_lookup(&get).unwrap().unwrap();
        assert_eq!(config.imap_port, 993);
        assert_eq!(config.smtp_host, "smtp.example.com");
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.from_address, "me@example.com");
        assert_eq!(config.folder, "INBOX");
        assert_eq!(config.password.expose_secret(), "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn username_is_required_with_host() {
        let get = lookup(&[("EMAIL_IMAP_HOST", "imap.example.com")]);
        assert!(matches!(
            EmailConfig::from_lookup(&get),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn bad_port_is_invalid() {
        let get = lookup(&[
            ("EMAIL_IMAP_HOST", "imap.example.com"),
            ("EMAIL_USERNAME", "me@example.com"),
            ("EMAIL_IMAP_PORT", "99999"),
        ]);
        assert!(matches!(
            EmailConfig::from_lookup(&get),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn parses_literal_markers() {
        assert_eq!(literal_len("* 1 FETCH (RFC822 {342}\r\n"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (FLAGS (\\Seen))\r\n"), None);
        assert_eq!(literal_len("A3 OK done\r\n"), None);
    }

    #[test]
    fn collects_search_results() {
        let lines = vec![
            "* SEARCH 3 7 9\r\n".to_string(),
            "* OK still here\r\n".to_string(),
        ];
        assert_eq!(search_results(&lines), vec!["3", "7", "9"]);
        assert!(search_results(&["* SEARCH\r\n".to_string()]).is_empty());
    }

    #[test]
    fn quotes_imap_strings() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[tokio::test]
    async fn zero_max_count_skips_network() {
        let get = lookup(&[
            ("EMAIL_IMAP_HOST", "imap.invalid"),
            ("EMAIL_USERNAME", "me@example.com"),
        ]);
        let mailbox = ImapMailbox::new(EmailConfig::from_lookup(&get).unwrap().unwrap());
        assert!(mailbox.fetch(&FetchFilter::Unseen, 0).await.unwrap().is_empty());
    }
}
