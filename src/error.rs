//! Error types for the mail agent.

use std::time::Duration;

/// Configuration-related errors.
///
/// All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ledger persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Notification channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send notification on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid recipient for channel {name}: {reason}")]
    InvalidRecipient { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Channel {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// LLM classifier errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Mailbox (fetch / label / delete) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to mail server: {0}")]
    Connect(String),

    #[error("Mail server rejected credentials: {0}")]
    Auth(String),

    #[error("Mail protocol error: {0}")]
    Protocol(String),

    #[error("Mailbox operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] MailboxError),

    #[error("Ledger write failed: {0}")]
    Ledger(#[from] DatabaseError),

    #[error("Processing interrupted before all actions were attempted")]
    Interrupted,
}
