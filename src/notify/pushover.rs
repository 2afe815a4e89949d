//! Pushover channel: posts to the Pushover messages API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ChannelError;
use crate::notify::{ChannelKind, NotificationEvent, NotificationSender};

const PUSHOVER_API_URL: &str = "https://api.pushover.net/1/messages.json";

/// Pushover credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct PushoverConfig {
    pub user_key: SecretString,
    pub api_token: SecretString,
    /// Restrict delivery to one device; all devices when unset.
    #[serde(default)]
    pub device: Option<String>,
}

/// Pushover API reply. `status == 1` means accepted.
#[derive(Debug, Deserialize)]
struct PushoverResponse {
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

pub struct PushoverSender {
    config: PushoverConfig,
    client: reqwest::Client,
    api_url: String,
}

impl PushoverSender {
    pub fn new(config: PushoverConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            api_url: PUSHOVER_API_URL.to_string(),
        }
    }

    /// Point the sender at a different endpoint.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn form_params(&self, event: &NotificationEvent) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("token", self.config.api_token.expose_secret().to_string()),
            ("user", self.config.user_key.expose_secret().to_string()),
            ("title", event.subject.clone()),
            ("message", event.body.clone()),
        ];
        if let Some(device) = &self.config.device {
            params.push(("device", device.clone()));
        }
        params
    }
}

#[async_trait]
impl NotificationSender for PushoverSender {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Pushover
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.api_url)
            .form(&self.form_params(event))
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = resp.status();
        let body: PushoverResponse = resp.json().await.map_err(|e| ChannelError::SendFailed {
            name: "pushover".into(),
            reason: format!("Unreadable response (HTTP {status}): {e}"),
        })?;

        if !status.is_success() || body.status != 1 {
            return Err(ChannelError::SendFailed {
                name: "pushover".into(),
                reason: format!("HTTP {status}: {}", body.errors.join("; ")),
            });
        }

        tracing::debug!(id = %event.message_id, "Pushover accepted notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> NotificationEvent {
        NotificationEvent {
            channel: ChannelKind::Pushover,
            recipient: "phone".into(),
            subject: "Important Email [Important] hi".into(),
            body: "From: boss@company.com".into(),
            message_id: "m-1".into(),
        }
    }

    #[test]
    fn form_params_include_credentials_and_payload() {
        let sender = PushoverSender::new(
            PushoverConfig {
                user_key: SecretString::from("user-abc"),
                api_token: SecretString::from("token-xyz"),
                device: Some("phone".into()),
            },
            reqwest::Client::new(),
        );
        let params = sender.form_params(&event());
        assert!(params.contains(&("token", "token-xyz".to_string())));
        assert!(params.contains(&("user", "user-abc".to_string())));
        assert!(params.contains(&("title", "Important Email [Important] hi".to_string())));
        assert!(params.contains(&("device", "phone".to_string())));
    }

    #[test]
    fn config_deserializes_without_device() {
        let cfg: PushoverConfig =
            serde_json::from_str(r#"{"user_key": "u", "api_token": "t"}"#).unwrap();
        assert!(cfg.device.is_none());
        assert_eq!(cfg.api_token.expose_secret(), "t");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let sender = PushoverSender::new(
            PushoverConfig {
                user_key: SecretString::from("u"),
                api_token: SecretString::from("t"),
                device: None,
            },
            reqwest::Client::new(),
        )
        .with_api_url("http://127.0.0.1:9/1/messages.json");
        assert!(sender.send(&event()).await.is_err());
    }
}
