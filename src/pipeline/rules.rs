//! Label criteria matching.
//!
//! A rule matches when any one of its criteria is satisfied, checked in order:
//! - exact sender address (case-insensitive)
//! - sender display name substring (case-insensitive)
//! - sender domain (case-insensitive, leading `@` ignored)
//! - subject substring token (case-insensitive)
//! - body preview substring token (case-insensitive)
//!
//! A rule with no criteria never matches. Matching is pure.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::{Message, normalize_domain};

/// Which criterion produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    Sender,
    SenderName,
    Domain,
    Subject,
    Body,
}

/// A named label plus its match criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    pub name: String,
    /// Exact sender addresses.
    #[serde(default)]
    pub from: Vec<String>,
    /// Substrings of the sender's display name.
    #[serde(default)]
    pub from_name: Vec<String>,
    /// Sender domains.
    #[serde(default)]
    pub from_domain: Vec<String>,
    /// Subject substring tokens.
    #[serde(default)]
    pub subject_contains: Vec<String>,
    /// Body preview substring tokens.
    #[serde(default)]
    pub body_contains: Vec<String>,
    /// Whether a match should trigger a notification.
    #[serde(default)]
    pub notify: bool,
}

impl LabelRule {
    /// Create a rule with no criteria.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: Vec::new(),
            from_name: Vec::new(),
            from_domain: Vec::new(),
            subject_contains: Vec::new(),
            body_contains: Vec::new(),
            notify: false,
        }
    }

    pub fn with_from(mut self, addresses: &[&str]) -> Self {
        self.from = addresses.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_from_name(mut self, names: &[&str]) -> Self {
        self.from_name = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_from_domain(mut self, domains: &[&str]) -> Self {
        self.from_domain = domains.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_subject_contains(mut self, tokens: &[&str]) -> Self {
        self.subject_contains = tokens.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_body_contains(mut self, tokens: &[&str]) -> Self {
        self.body_contains = tokens.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    /// True if at least one criterion list is non-empty.
    pub fn has_criteria(&self) -> bool {
        [
            &self.from,
            &self.from_name,
            &self.from_domain,
            &self.subject_contains,
            &self.body_contains,
        ]
        .iter()
        .any(|list| !list.is_empty())
    }

    pub fn matches(&self, message: &Message) -> bool {
        match_reason(message, self).is_some()
    }
}

/// Evaluate one rule against one message.
pub fn matches(message: &Message, rule: &LabelRule) -> bool {
    match_reason(message, rule).is_some()
}

/// Like [`matches`], but reports the first criterion that fired.
pub fn match_reason(message: &Message, rule: &LabelRule) -> Option<MatchedBy> {
    if rule
        .from
        .iter()
        .any(|addr| addr.trim().eq_ignore_ascii_case(&message.sender))
    {
        return Some(MatchedBy::Sender);
    }

    if contains_any(&message.sender_name, &rule.from_name) {
        return Some(MatchedBy::SenderName);
    }

    if !message.sender_domain.is_empty()
        && rule
            .from_domain
            .iter()
            .any(|domain| normalize_domain(domain) == message.sender_domain)
    {
        return Some(MatchedBy::Domain);
    }

    if contains_any(&message.subject, &rule.subject_contains) {
        return Some(MatchedBy::Subject);
    }

    if contains_any(&message.body_preview, &rule.body_contains) {
        return Some(MatchedBy::Body);
    }

    None
}

/// Case-insensitive substring test. Blank tokens never match.
fn contains_any(haystack: &str, tokens: &[String]) -> bool {
    if tokens.is_empty() || haystack.is_empty() {
        return false;
    }
    let haystack = haystack.to_lowercase();
    tokens
        .iter()
        .map(|token| token.trim().to_lowercase())
        .any(|token| !token.is_empty() && haystack.contains(&token))
}
