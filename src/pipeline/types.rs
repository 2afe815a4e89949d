//! Shared types for the message processing pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailboxError;

// ── Message snapshot ────────────────────────────────────────────────

/// Immutable snapshot of one email at the time of processing.
///
/// Mailbox adapters convert their native format into this struct.
/// Decisions about a message are separate values; the snapshot is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Provider-stable unique identifier.
    pub id: String,
    /// Bare sender address (`user@example.com`).
    pub sender: String,
    /// Display name from the `From` header, empty when absent.
    #[serde(default)]
    pub sender_name: String,
    /// Lowercased domain part of `sender`, empty if the address has none.
    pub sender_domain: String,
    pub subject: String,
    /// Leading slice of the body text.
    pub body_preview: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    /// Build a snapshot, normalising the sender and deriving its domain.
    ///
    /// `from` may be a bare address or a display form like `Jane <jane@x.com>`.
    pub fn new(
        id: impl Into<String>,
        from: &str,
        subject: impl Into<String>,
        body_preview: impl Into<String>,
        received_at: DateTime<Utc>,
        is_read: bool,
    ) -> Self {
        let sender = extract_address(from);
        let sender_domain = extract_domain(&sender);
        Self {
            id: id.into(),
            sender,
            sender_name: extract_name(from),
            sender_domain,
            subject: subject.into(),
            body_preview: body_preview.into(),
            received_at,
            is_read,
        }
    }
}

/// Extract the bare address from a `From` header value.
pub fn extract_address(from: &str) -> String {
    let trimmed = from.trim();
    if let (Some(start), Some(end)) = (trimmed.rfind('<'), trimmed.rfind('>'))
        && end > start
    {
        return trimmed[start + 1..end].trim().to_string();
    }
    trimmed.to_string()
}

/// Display name of a `From` header value, without quotes.
pub fn extract_name(from: &str) -> String {
    let trimmed = from.trim();
    match trimmed.rfind('<') {
        Some(start) => trimmed[..start].trim().trim_matches('"').trim().to_string(),
        None => String::new(),
    }
}

/// Domain part of an address, lowercased. Empty when there is no `@`.
pub fn extract_domain(address: &str) -> String {
    match address.rsplit_once('@') {
        Some((_, domain)) => normalize_domain(domain),
        None => String::new(),
    }
}

/// Canonical form for configured domains: trimmed, no leading `@`, lowercase.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('@').to_lowercase()
}

// ── Classification ──────────────────────────────────────────────────

/// Where a label verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    Rule,
    Llm,
}

/// One label assigned to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedLabel {
    pub name: String,
    pub source: LabelSource,
}

/// Final label set for one message.
///
/// Labels keep rule declaration order and never repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub labels: Vec<MatchedLabel>,
    pub should_notify: bool,
}

impl ClassificationResult {
    /// Result with no labels and no notification.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }

    /// Add a label unless it is already present. Returns whether it was added.
    pub fn push(&mut self, name: impl Into<String>, source: LabelSource) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.labels.push(MatchedLabel { name, source });
        true
    }

    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }

    pub fn source_of(&self, name: &str) -> Option<LabelSource> {
        self.labels.iter().find(|l| l.name == name).map(|l| l.source)
    }
}

// ── Cleaning ────────────────────────────────────────────────────────

/// Why a message is eligible for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanReason {
    Newsletter,
    Stale,
    Read,
}

impl CleanReason {
    /// Short reason code for logging and reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Newsletter => "newsletter",
            Self::Stale => "stale",
            Self::Read => "read",
        }
    }
}

/// Deletion verdict for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningDecision {
    pub delete: bool,
    pub reason: Option<CleanReason>,
}

impl CleaningDecision {
    pub fn keep() -> Self {
        Self {
            delete: false,
            reason: None,
        }
    }

    pub fn delete(reason: CleanReason) -> Self {
        Self {
            delete: true,
            reason: Some(reason),
        }
    }
}

// ── Mailbox collaborators ───────────────────────────────────────────

/// Source of message snapshots.
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    /// Fetch messages received at or after `since` (all messages when `None`).
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Message>, MailboxError>;
}

/// Applies label names to a message. Must be idempotent.
#[async_trait]
pub trait LabelApplier: Send + Sync {
    async fn apply(&self, message_id: &str, labels: &[String]) -> Result<(), MailboxError>;
}

/// Deletes a message. Deleting an already-deleted id is not an error.
#[async_trait]
pub trait Deleter: Send + Sync {
    async fn delete(&self, message_id: &str) -> Result<(), MailboxError>;
}

/// Leaves a server-side mark on a finished message so later fetches skip it,
/// even when the ledger did not survive a restart.
#[async_trait]
pub trait ProcessedMarker: Send + Sync {
    async fn mark_processed(&self, message_id: &str) -> Result<(), MailboxError>;
}
