//! Mailbox access over IMAP.
//!
//! One adapter serves both providers. Gmail labels are applied through the
//! `X-GM-LABELS` extension; other servers get IMAP keywords instead.

mod imap;

pub use imap::ImapMailbox;

use secrecy::SecretString;
use serde::Serialize;

/// Which labelling dialect the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MailProvider {
    Gmail,
    Other,
}

impl MailProvider {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Other => "other",
        }
    }
}

/// Resolved IMAP account settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub provider: MailProvider,
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Label (Gmail) or keyword (other servers) marking finished messages.
    /// Marked messages are left out of every fetch. `None` disables marking.
    pub processed_marker: Option<String>,
}
