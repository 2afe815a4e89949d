//! Mail Agent: rule-based email labelling, cleanup and notification.

pub mod config;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod notify;
pub mod pipeline;
pub mod retry;
pub mod store;
