//! Email channel: SMTP via lettre.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ChannelError;
use crate::notify::{ChannelKind, NotificationEvent, NotificationSender};

/// Port that uses implicit TLS; anything else negotiates STARTTLS.
const SMTPS_PORT: u16 = 465;

fn default_smtp_port() -> u16 {
    SMTPS_PORT
}

/// SMTP settings for sending notification emails.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpNotifyConfig {
    pub smtp_server: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub to_address: String,
}

pub struct SmtpSender {
    config: SmtpNotifyConfig,
}

impl SmtpSender {
    pub fn new(config: SmtpNotifyConfig) -> Self {
        Self { config }
    }

    /// Build the outgoing message for an event.
    fn build_message(&self, event: &NotificationEvent) -> Result<Message, ChannelError> {
        let from: Mailbox = self.config.from_address.parse().map_err(|e| {
            ChannelError::SendFailed {
                name: "email".into(),
                reason: format!("Invalid from address: {e}"),
            }
        })?;
        let to: Mailbox = event
            .recipient
            .parse()
            .map_err(|e| ChannelError::InvalidRecipient {
                name: "email".into(),
                reason: format!("Invalid to address: {e}"),
            })?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(event.subject.as_str())
            .body(event.body.clone())
            .map_err(|e| ChannelError::SendFailed {
                name: "email".into(),
                reason: format!("Failed to build email: {e}"),
            })
    }

    fn transport(&self) -> Result<SmtpTransport, ChannelError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        let builder = if self.config.smtp_port == SMTPS_PORT {
            SmtpTransport::relay(&self.config.smtp_server)
        } else {
            SmtpTransport::starttls_relay(&self.config.smtp_server)
        }
        .map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("SMTP relay error: {e}"),
        })?;

        Ok(builder
            .port(self.config.smtp_port)
            .credentials(creds)
            .build())
    }
}

#[async_trait]
impl NotificationSender for SmtpSender {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        let email = self.build_message(event)?;
        let transport = self.transport()?;

        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "email".into(),
                reason: format!("SMTP task panicked: {e}"),
            })?
            .map_err(|e| ChannelError::SendFailed {
                name: "email".into(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        tracing::info!(id = %event.message_id, to = %event.recipient, "Notification email sent");
        Ok(())
    }
}
