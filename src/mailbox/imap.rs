//! Raw IMAP over rustls.
//!
//! The session is blocking and lives behind a std mutex; every call runs on
//! `spawn_blocking`. The connection is opened fresh at the start of each
//! fetch and reused by the label/delete calls that follow. Any error drops
//! it so the next call reconnects.
//!
//! Message ids are IMAP UIDs in the configured mailbox. Finished messages get
//! the configured processed marker and are excluded from later searches.

use std::io::{BufRead, BufReader, Read, Write as IoWrite};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::error::MailboxError;
use crate::mailbox::{ImapConfig, MailProvider};
use crate::pipeline::types::{Deleter, LabelApplier, Message, MessageFetcher, ProcessedMarker};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// UIDs per `UID FETCH` command.
const FETCH_BATCH: usize = 50;

/// Characters kept from the body for classification.
const PREVIEW_CHARS: usize = 500;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP-backed fetcher, labeller and deleter.
#[derive(Clone)]
pub struct ImapMailbox {
    config: Arc<ImapConfig>,
    session: Arc<Mutex<Option<ImapSession>>>,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config: Arc::new(config),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn provider(&self) -> MailProvider {
        self.config.provider
    }

    /// Run `op` against a live session on the blocking pool.
    async fn run<T, F>(&self, fresh: bool, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, MailboxError> + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        let session = Arc::clone(&self.session);

        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&session);
            if fresh {
                *guard = None;
            }
            if guard.is_none() {
                *guard = Some(ImapSession::connect(&config)?);
            }
            let Some(live) = guard.as_mut() else {
                return Err(MailboxError::Connect("IMAP session unavailable".into()));
            };
            let result = op(live);
            if result.is_err() {
                *guard = None;
            }
            result
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task panicked: {e}")))?
    }
}

fn lock(session: &Mutex<Option<ImapSession>>) -> MutexGuard<'_, Option<ImapSession>> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl MessageFetcher for ImapMailbox {
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Message>, MailboxError> {
        let criteria = search_criteria(
            self.config.provider,
            since,
            self.config.processed_marker.as_deref(),
        );
        self.run(true, move |session| {
            let uids = parse_search(&session.command(&format!("UID SEARCH {criteria}"))?);
            debug!(count = uids.len(), criteria = %criteria, "IMAP search complete");

            let mut messages = Vec::with_capacity(uids.len());
            for chunk in uids.chunks(FETCH_BATCH) {
                let set = chunk
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                let lines = session.command(&format!(
                    "UID FETCH {set} (UID FLAGS INTERNALDATE BODY.PEEK[])"
                ))?;
                messages.extend(lines.iter().filter_map(parse_fetch).map(|item| to_message(&item)));
            }
            Ok(messages)
        })
        .await
    }
}

#[async_trait]
impl LabelApplier for ImapMailbox {
    async fn apply(&self, message_id: &str, labels: &[String]) -> Result<(), MailboxError> {
        let uid = parse_uid(message_id)?;
        let Some(command) = label_command(self.config.provider, uid, labels) else {
            return Ok(());
        };
        self.run(false, move |session| session.command(&command).map(|_| ()))
            .await?;
        info!(id = message_id, labels = ?labels, "Labels applied");
        Ok(())
    }
}

#[async_trait]
impl Deleter for ImapMailbox {
    async fn delete(&self, message_id: &str) -> Result<(), MailboxError> {
        let uid = parse_uid(message_id)?;
        self.run(false, move |session| {
            // A UID that no longer exists stores nothing and still returns OK.
            session.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Deleted)"))?;
            if session.command(&format!("UID EXPUNGE {uid}")).is_err() {
                session.command("EXPUNGE")?;
            }
            Ok(())
        })
        .await?;
        info!(id = message_id, "Message deleted");
        Ok(())
    }
}

#[async_trait]
impl ProcessedMarker for ImapMailbox {
    async fn mark_processed(&self, message_id: &str) -> Result<(), MailboxError> {
        let Some(marker) = self.config.processed_marker.clone() else {
            return Ok(());
        };
        let uid = parse_uid(message_id)?;
        let Some(command) = label_command(self.config.provider, uid, &[marker]) else {
            return Ok(());
        };
        self.run(false, move |session| session.command(&command).map(|_| ()))
            .await?;
        debug!(id = message_id, "Marked processed");
        Ok(())
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// One logical server response line plus any literals embedded in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

struct ImapSession {
    stream: BufReader<TlsStream>,
    tag: u32,
}

impl ImapSession {
    fn connect(config: &ImapConfig) -> Result<Self, MailboxError> {
        let tcp = TcpStream::connect((config.server.as_str(), config.port))
            .map_err(|e| MailboxError::Connect(format!("{}:{}: {e}", config.server, config.port)))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT)).map_err(io_error)?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.server.clone())
            .map_err(|e| MailboxError::Connect(format!("Invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Connect(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            tag: 0,
        };

        let greeting = session.read_line()?;
        if !greeting.text.starts_with("* OK") && !greeting.text.starts_with("* PREAUTH") {
            return Err(MailboxError::Connect(format!(
                "Unexpected greeting: {}",
                greeting.text
            )));
        }

        session
            .command(&format!(
                "LOGIN {} {}",
                quote(&config.username),
                quote(config.password.expose_secret())
            ))
            .map_err(|e| match e {
                MailboxError::Protocol(reason) => MailboxError::Auth(reason),
                other => other,
            })?;
        session.command(&format!("SELECT {}", quote(&config.mailbox)))?;

        info!(
            server = %config.server,
            provider = config.provider.name(),
            mailbox = %config.mailbox,
            "IMAP session established"
        );
        Ok(session)
    }

    /// Send a tagged command and collect untagged lines until its completion.
    fn command(&mut self, command: &str) -> Result<Vec<ResponseLine>, MailboxError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);

        let stream = self.stream.get_mut();
        IoWrite::write_all(stream, format!("{tag} {command}\r\n").as_bytes()).map_err(io_error)?;
        IoWrite::flush(stream).map_err(io_error)?;

        let prefix = format!("{tag} ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.text.strip_prefix(&prefix) {
                if status.starts_with("OK") {
                    return Ok(lines);
                }
                let verb = command.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
                return Err(MailboxError::Protocol(format!("{verb}: {status}")));
            }
            lines.push(line);
        }
    }

    /// Read one logical line, following `{N}` literals.
    fn read_line(&mut self) -> Result<ResponseLine, MailboxError> {
        let mut line = ResponseLine::default();
        loop {
            let mut raw = Vec::new();
            let n = self.stream.read_until(b'\n', &mut raw).map_err(io_error)?;
            if n == 0 {
                return Err(MailboxError::Connect("IMAP connection closed".into()));
            }
            let fragment = String::from_utf8_lossy(&raw);
            let fragment = fragment.trim_end_matches(['\r', '\n']);
            line.text.push_str(fragment);

            match literal_len(fragment) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal).map_err(io_error)?;
                    line.literals.push(literal);
                }
                None => return Ok(line),
            }
        }
    }
}

fn io_error(e: std::io::Error) -> MailboxError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            MailboxError::Timeout(READ_TIMEOUT)
        }
        _ => MailboxError::Protocol(e.to_string()),
    }
}

// ── Protocol helpers ────────────────────────────────────────────────

/// `N` when a response fragment ends with a `{N}` literal marker.
fn literal_len(fragment: &str) -> Option<usize> {
    let open = fragment.strip_suffix('}')?.rfind('{')?;
    fragment[open + 1..fragment.len() - 1].parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// IMAP `date` for SEARCH SINCE (day granularity).
fn imap_date(at: DateTime<Utc>) -> String {
    at.format("%d-%b-%Y").to_string()
}

fn parse_uid(message_id: &str) -> Result<u32, MailboxError> {
    message_id
        .parse()
        .map_err(|_| MailboxError::Protocol(format!("Not an IMAP UID: {message_id}")))
}

fn parse_search(lines: &[ResponseLine]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// Turn label names into IMAP keywords: atoms only, no spaces or specials.
fn keyword(label: &str) -> String {
    let word: String = label
        .trim()
        .trim_start_matches('\\')
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && !"(){%*\"\\]".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    word
}

/// `UID SEARCH` criteria: the date window, minus already marked messages.
fn search_criteria(
    provider: MailProvider,
    since: Option<DateTime<Utc>>,
    marker: Option<&str>,
) -> String {
    let mut parts = Vec::new();
    if let Some(since) = since {
        parts.push(format!("SINCE {}", imap_date(since)));
    }
    match (provider, marker.map(str::trim)) {
        (MailProvider::Gmail, Some(label)) if !label.is_empty() => {
            parts.push(format!("NOT X-GM-LABELS {}", quote(label)));
        }
        (MailProvider::Other, Some(label)) if !keyword(label).is_empty() => {
            parts.push(format!("UNKEYWORD {}", keyword(label)));
        }
        _ => {}
    }
    if parts.is_empty() {
        "ALL".to_string()
    } else {
        parts.join(" ")
    }
}

/// Store command for adding `labels` to `uid`, or `None` if nothing to add.
fn label_command(provider: MailProvider, uid: u32, labels: &[String]) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    let command = match provider {
        MailProvider::Gmail => {
            let quoted: Vec<String> = labels.iter().map(|l| quote(l)).collect();
            format!("UID STORE {uid} +X-GM-LABELS ({})", quoted.join(" "))
        }
        MailProvider::Other => {
            let keywords: Vec<String> = labels
                .iter()
                .map(|l| keyword(l))
                .filter(|k| !k.is_empty())
                .collect();
            if keywords.is_empty() {
                return None;
            }
            format!("UID STORE {uid} +FLAGS.SILENT ({})", keywords.join(" "))
        }
    };
    Some(command)
}

/// A `* n FETCH (...)` response, before MIME parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FetchedItem {
    uid: u32,
    flags: Vec<String>,
    internal_date: Option<DateTime<Utc>>,
    body: Vec<u8>,
}

/// Text following `key` where it starts a data item.
fn item_after<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let mut from = 0;
    while let Some(pos) = text[from..].find(key) {
        let start = from + pos;
        let boundary = text[..start].ends_with(['(', ' ']);
        if boundary {
            return Some(&text[start + key.len()..]);
        }
        from = start + key.len();
    }
    None
}

fn parse_fetch(line: &ResponseLine) -> Option<FetchedItem> {
    let text = &line.text;
    if !text.starts_with("* ") || !text.contains(" FETCH (") {
        return None;
    }

    let uid = item_after(text, "UID ")?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;

    let flags = item_after(text, "FLAGS (")
        .and_then(|rest| rest.split(')').next())
        .map(|f| f.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let internal_date = item_after(text, "INTERNALDATE \"")
        .and_then(|rest| rest.split('"').next())
        .and_then(|raw| DateTime::parse_from_str(raw.trim(), "%d-%b-%Y %H:%M:%S %z").ok())
        .map(|d| d.with_timezone(&Utc));

    Some(FetchedItem {
        uid,
        flags,
        internal_date,
        body: line.literals.first().cloned().unwrap_or_default(),
    })
}

fn to_message(item: &FetchedItem) -> Message {
    let parsed = MessageParser::default().parse(&item.body);

    let (sender, subject, preview, header_date) = match &parsed {
        Some(p) => (
            extract_sender(p),
            p.subject().unwrap_or_default().to_string(),
            preview(&extract_text(p)),
            p.date().and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
        ),
        None => ("unknown".to_string(), String::new(), String::new(), None),
    };

    let is_read = item.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen"));
    let received_at = item
        .internal_date
        .or(header_date)
        .unwrap_or_else(Utc::now);

    Message::new(item.uid.to_string(), &sender, subject, preview, received_at, is_read)
}

/// `From` as `Name <address>`, or the bare address when there is no name.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    let Some(first) = parsed.from().and_then(|addr| addr.first()) else {
        return "unknown".into();
    };
    let address = first.address().unwrap_or("unknown");
    match first.name() {
        Some(name) if !name.trim().is_empty() => format!("{} <{address}>", name.trim()),
        _ => address.to_string(),
    }
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

fn strip_html(html: &str) -> String {
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

/// Whitespace-normalised prefix of the body.
fn preview(text: &str) -> String {
    let normalised = text.split_whitespace().collect::<Vec<_>>().join(" ");
    normalised.chars().take(PREVIEW_CHARS).collect()
}
