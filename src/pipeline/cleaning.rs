//! Inbox hygiene: decides whether a message should be deleted.
//!
//! Checks run in a fixed order and the first hit wins:
//! 1. newsletter sender domain
//! 2. older than the configured age
//! 3. already read

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::{CleanReason, CleaningDecision, Message, normalize_domain};

/// Deletion thresholds, loaded once from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningRule {
    #[serde(default)]
    pub delete_newsletters: bool,
    #[serde(default)]
    pub newsletter_domains: Vec<String>,
    /// Age threshold in whole days. `None` or `0` disables the age check.
    #[serde(default)]
    pub delete_older_than: Option<u32>,
    #[serde(default)]
    pub delete_read: bool,
}

impl CleaningRule {
    /// True if any check can ever fire.
    pub fn is_enabled(&self) -> bool {
        self.delete_newsletters || self.max_age_days().is_some() || self.delete_read
    }

    /// Effective age threshold; zero counts as unset.
    pub fn max_age_days(&self) -> Option<u32> {
        self.delete_older_than.filter(|days| *days > 0)
    }
}

/// Evaluates a [`CleaningRule`] against messages.
#[derive(Debug, Clone)]
pub struct CleaningPolicy {
    rule: CleaningRule,
    newsletter_domains: Vec<String>,
}

impl CleaningPolicy {
    pub fn new(rule: CleaningRule) -> Self {
        let newsletter_domains = rule
            .newsletter_domains
            .iter()
            .map(|d| normalize_domain(d))
            .filter(|d| !d.is_empty())
            .collect();
        Self {
            rule,
            newsletter_domains,
        }
    }

    pub fn rule(&self) -> &CleaningRule {
        &self.rule
    }

    /// Decide deletion for `message` as of `now`.
    pub fn evaluate(&self, message: &Message, now: DateTime<Utc>) -> CleaningDecision {
        if self.rule.delete_newsletters && self.is_newsletter_domain(&message.sender_domain) {
            return CleaningDecision::delete(CleanReason::Newsletter);
        }

        if let Some(max_days) = self.rule.max_age_days()
            && age_in_days(message.received_at, now) > i64::from(max_days)
        {
            return CleaningDecision::delete(CleanReason::Stale);
        }

        if self.rule.delete_read && message.is_read {
            return CleaningDecision::delete(CleanReason::Read);
        }

        CleaningDecision::keep()
    }

    fn is_newsletter_domain(&self, domain: &str) -> bool {
        !domain.is_empty() && self.newsletter_domains.iter().any(|d| d == domain)
    }
}

/// Whole calendar days (UTC) between `received` and `now`.
///
/// Truncating to dates keeps the verdict stable for every run on the same day.
pub fn age_in_days(received: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now.date_naive() - received.date_naive()).num_days()
}
