//! Twilio channel: SMS and WhatsApp via the Twilio Messages API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ChannelError;
use crate::notify::{ChannelKind, NotificationEvent, NotificationSender};

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Twilio account and numbers for one channel.
#[derive(Debug, Clone, Deserialize)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
    pub to_number: String,
}

/// Twilio addresses WhatsApp numbers as `whatsapp:+E164`.
pub fn whatsapp_address(number: &str) -> String {
    let number = number.trim();
    if number.starts_with("whatsapp:") {
        number.to_string()
    } else {
        format!("whatsapp:{number}")
    }
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct TwilioErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

/// Sends SMS or WhatsApp messages, depending on `kind`.
pub struct TwilioSender {
    config: TwilioConfig,
    kind: ChannelKind,
    client: reqwest::Client,
    api_base: String,
}

impl TwilioSender {
    pub fn new(config: TwilioConfig, kind: ChannelKind, client: reqwest::Client) -> Self {
        Self {
            config,
            kind,
            client,
            api_base: TWILIO_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    fn from_address(&self) -> String {
        match self.kind {
            ChannelKind::WhatsApp => whatsapp_address(&self.config.from_number),
            _ => self.config.from_number.clone(),
        }
    }

    fn to_address(&self, event: &NotificationEvent) -> String {
        match self.kind {
            ChannelKind::WhatsApp => whatsapp_address(&event.recipient),
            _ => event.recipient.clone(),
        }
    }
}

#[async_trait]
impl NotificationSender for TwilioSender {
    fn channel(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        let name = self.kind.name();
        if event.recipient.trim().is_empty() {
            return Err(ChannelError::InvalidRecipient {
                name: name.into(),
                reason: "empty destination number".into(),
            });
        }

        let params = [
            ("From", self.from_address()),
            ("To", self.to_address(event)),
            ("Body", event.body.clone()),
        ];

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&params)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let err: TwilioErrorBody = resp.json().await.unwrap_or(TwilioErrorBody {
                code: None,
                message: String::new(),
            });
            return Err(ChannelError::SendFailed {
                name: name.into(),
                reason: format!(
                    "HTTP {status} (code {}): {}",
                    err.code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                    err.message
                ),
            });
        }

        let sent: TwilioMessage = resp.json().await.map_err(|e| ChannelError::SendFailed {
            name: name.into(),
            reason: format!("Unreadable response: {e}"),
        })?;

        tracing::info!(
            id = %event.message_id,
            channel = name,
            sid = %sent.sid,
            "Twilio message queued"
        );
        Ok(())
    }
}
