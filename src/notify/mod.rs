//! Notification routing and delivery.
//!
//! One channel is active per run. The router decides whether a message
//! warrants a notification, renders the payload for that channel, and hands
//! it to the channel's sender with bounded retry. Delivery failures are
//! returned to the caller, never raised.

pub mod email;
pub mod pushover;
pub mod render;
pub mod twilio;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::ChannelError;
use crate::pipeline::types::{ClassificationResult, Message};
use crate::retry::{Attempted, RetryPolicy};

pub use email::{SmtpNotifyConfig, SmtpSender};
pub use pushover::{PushoverConfig, PushoverSender};
pub use twilio::{TwilioConfig, TwilioSender};

/// Default per-call timeout for channel senders.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Closed set of delivery channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Pushover,
    Email,
    Sms,
    WhatsApp,
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pushover => "pushover",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::WhatsApp => "whatsapp",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The active channel together with only the settings it needs.
#[derive(Debug, Clone)]
pub enum NotificationChannel {
    Pushover(PushoverConfig),
    Email(SmtpNotifyConfig),
    Sms(TwilioConfig),
    WhatsApp(TwilioConfig),
}

impl NotificationChannel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Pushover(_) => ChannelKind::Pushover,
            Self::Email(_) => ChannelKind::Email,
            Self::Sms(_) => ChannelKind::Sms,
            Self::WhatsApp(_) => ChannelKind::WhatsApp,
        }
    }

    /// Where events on this channel are delivered.
    pub fn recipient(&self) -> String {
        match self {
            Self::Pushover(cfg) => cfg.device.clone().unwrap_or_else(|| "all-devices".into()),
            Self::Email(cfg) => cfg.to_address.clone(),
            Self::Sms(cfg) => cfg.to_number.clone(),
            Self::WhatsApp(cfg) => twilio::whatsapp_address(&cfg.to_number),
        }
    }
}

/// A rendered notification, ready for a channel sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEvent {
    pub channel: ChannelKind,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub message_id: String,
}

/// Delivers events on one channel.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    fn channel(&self) -> ChannelKind;

    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError>;
}

/// Build the sender for the configured channel.
pub fn create_sender(
    channel: &NotificationChannel,
    http: reqwest::Client,
) -> Arc<dyn NotificationSender> {
    match channel {
        NotificationChannel::Pushover(cfg) => Arc::new(PushoverSender::new(cfg.clone(), http)),
        NotificationChannel::Email(cfg) => Arc::new(SmtpSender::new(cfg.clone())),
        NotificationChannel::Sms(cfg) => {
            Arc::new(TwilioSender::new(cfg.clone(), ChannelKind::Sms, http))
        }
        NotificationChannel::WhatsApp(cfg) => {
            Arc::new(TwilioSender::new(cfg.clone(), ChannelKind::WhatsApp, http))
        }
    }
}

/// Routes notify-worthy messages to the active channel.
pub struct NotificationRouter {
    channel: NotificationChannel,
    sender: Arc<dyn NotificationSender>,
    send_timeout: Duration,
    retry: RetryPolicy,
}

impl NotificationRouter {
    pub fn new(channel: NotificationChannel, sender: Arc<dyn NotificationSender>) -> Self {
        Self {
            channel,
            sender,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn channel(&self) -> ChannelKind {
        self.channel.kind()
    }

    /// Build the event for a message, or `None` when it should not notify.
    pub fn route(
        &self,
        message: &Message,
        classification: &ClassificationResult,
    ) -> Option<NotificationEvent> {
        if !classification.should_notify {
            return None;
        }

        let kind = self.channel.kind();
        let (subject, body) = render::render(kind, message, classification);
        debug!(id = %message.id, channel = %kind, "Routing notification");

        Some(NotificationEvent {
            channel: kind,
            recipient: self.channel.recipient(),
            subject,
            body,
            message_id: message.id.clone(),
        })
    }

    /// Deliver an event with bounded retry. Never panics or propagates.
    pub async fn dispatch(&self, event: &NotificationEvent) -> Attempted<(), ChannelError> {
        let name = event.channel.name();
        let outcome = self
            .retry
            .run(
                "notify",
                self.send_timeout,
                || self.sender.send(event),
                |timeout| ChannelError::Timeout {
                    name: name.to_string(),
                    timeout,
                },
            )
            .await;

        match &outcome.result {
            Ok(()) => info!(
                id = %event.message_id,
                channel = name,
                attempts = outcome.attempts,
                "Notification sent"
            ),
            Err(e) => error!(
                id = %event.message_id,
                channel = name,
                attempts = outcome.attempts,
                error = %e,
                "Notification failed permanently"
            ),
        }
        outcome
    }
}
