//! Configuration loading.
//!
//! The agent reads a single YAML file. Any string value may contain `${NAME}`
//! placeholders which are filled from the process environment at load time,
//! so secrets live in the environment (or `.env`) rather than in the file.
//!
//! Unused notification sections are dropped before placeholder resolution, so
//! they may reference variables that are not set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

use crate::error::ConfigError;
use crate::llm::LlmConfig;
use crate::mailbox::{ImapConfig, MailProvider};
use crate::notify::{
    ChannelKind, NotificationChannel, PushoverConfig, SmtpNotifyConfig, TwilioConfig,
};
use crate::pipeline::cleaning::CleaningRule;
use crate::pipeline::processor::PipelineConfig;
use crate::pipeline::rules::LabelRule;
use crate::retry::RetryPolicy;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "MAIL_AGENT_CONFIG";

/// Used when `MAIL_AGENT_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

const PLACEHOLDER_PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}";

const GMAIL_IMAP_SERVER: &str = "imap.gmail.com";
const IMAPS_PORT: u16 = 993;
/// Label name the agent leaves on finished messages.
const DEFAULT_PROCESSED_LABEL: &str = "Processed";

/// Fully validated agent configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mailbox: ImapConfig,
    pub poll_interval: Duration,
    pub labels: Vec<LabelRule>,
    pub cleaning: CleaningRule,
    /// `None` when no `notifications` section is present.
    pub notifications: Option<NotificationChannel>,
    pub llm: Option<LlmConfig>,
    pub processing: ProcessingConfig,
    pub ledger: LedgerConfig,
    pub logging: LoggingConfig,
}

/// Concurrency, timeout and retry tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_concurrency: usize,
    pub llm_timeout_secs: u64,
    pub action_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Cycles a message waits for a working LLM before it is settled unlabelled.
    pub llm_retry_cycles: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            llm_timeout_secs: 20,
            action_timeout_secs: 30,
            send_timeout_secs: 15,
            max_attempts: 3,
            retry_backoff_ms: 500,
            llm_retry_cycles: 3,
        }
    }
}

impl ProcessingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_backoff_ms))
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_concurrency: self.max_concurrency.max(1),
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            retry: self.retry_policy(),
            llm_retry_cycles: self.llm_retry_cycles.max(1),
        }
    }
}

/// Where processed message ids are persisted. In-memory only when unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// File log destination. Console only when unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// ── Raw file shape ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConfig {
    email: RawEmail,
    #[serde(default)]
    labels: Vec<RawLabel>,
    #[serde(default)]
    cleaning: CleaningRule,
    #[serde(default)]
    notifications: Option<RawNotifications>,
    #[serde(default)]
    llm: Option<LlmConfig>,
    #[serde(default)]
    processing: ProcessingConfig,
    #[serde(default)]
    ledger: LedgerConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ProviderChoice {
    #[default]
    Auto,
    Gmail,
    Other,
}

fn default_processed_label() -> String {
    DEFAULT_PROCESSED_LABEL.to_string()
}

fn default_check_frequency() -> u64 {
    crate::pipeline::poller::DEFAULT_POLL_INTERVAL.as_secs()
}

#[derive(Debug, Deserialize)]
struct RawEmail {
    #[serde(default)]
    provider: ProviderChoice,
    #[serde(default = "default_check_frequency")]
    check_frequency: u64,
    /// Server-side mark for finished messages; empty disables it.
    #[serde(default = "default_processed_label")]
    processed_label: String,
    #[serde(default)]
    gmail: Option<RawImapAccount>,
    #[serde(default)]
    other: Option<RawImapAccount>,
}

#[derive(Debug, Deserialize)]
struct RawImapAccount {
    #[serde(default)]
    imap_server: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    username: String,
    password: SecretString,
    #[serde(default)]
    mailbox: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCriteria {
    #[serde(default, deserialize_with = "one_or_many")]
    from: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    from_name: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    from_domain: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    subject_contains: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    body_contains: Vec<String>,
    #[serde(default)]
    notify: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
    #[serde(default)]
    criteria: RawCriteria,
    #[serde(default)]
    notify: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawNotifications {
    method: ChannelKind,
    #[serde(default)]
    pushover: Option<Value>,
    #[serde(default)]
    email: Option<Value>,
    #[serde(default)]
    sms: Option<RawTwilioSection>,
    #[serde(default)]
    whatsapp: Option<RawTwilioSection>,
}

fn default_twilio_provider() -> String {
    "twilio".to_string()
}

#[derive(Debug, Deserialize)]
struct RawTwilioSection {
    #[serde(default = "default_twilio_provider")]
    provider: String,
    #[serde(default)]
    twilio: Option<Value>,
}

/// Accept either `key: value` or `key: [values]`.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

// ── Loading ─────────────────────────────────────────────────────────

impl AppConfig {
    /// Config path from `MAIL_AGENT_CONFIG`, or the default.
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load, resolve against the process environment, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text, |name| std::env::var(name).ok())
    }

    /// Parse YAML text with an explicit variable lookup.
    pub fn from_yaml_str<F>(text: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut root: Value =
            serde_yaml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        prune_unused_sections(&mut root);

        let pattern = Regex::new(PLACEHOLDER_PATTERN)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        resolve_placeholders(&mut root, &pattern, &lookup)?;

        let raw: RawConfig =
            serde_yaml::from_value(root).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.into_config()
    }
}

impl RawConfig {
    fn into_config(self) -> Result<AppConfig, ConfigError> {
        if self.email.check_frequency == 0 {
            return Err(invalid("email.check_frequency", "must be positive"));
        }
        if self.processing.max_attempts == 0 {
            return Err(invalid("processing.max_attempts", "must be positive"));
        }

        if self.cleaning.delete_older_than == Some(0) {
            tracing::warn!("cleaning.delete_older_than is 0, age-based deletion disabled");
        }

        let mut mailbox =
            resolve_mailbox(self.email.provider, self.email.gmail, self.email.other)?;
        let marker = self.email.processed_label.trim();
        mailbox.processed_marker = (!marker.is_empty()).then(|| marker.to_string());
        let labels = convert_labels(self.labels)?;
        let notifications = self.notifications.map(convert_notifications).transpose()?;

        Ok(AppConfig {
            mailbox,
            poll_interval: Duration::from_secs(self.email.check_frequency),
            labels,
            cleaning: self.cleaning,
            notifications,
            llm: self.llm,
            processing: self.processing,
            ledger: self.ledger,
            logging: self.logging,
        })
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn missing(key: &str, hint: &str) -> ConfigError {
    ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    }
}

/// Drop notification sections other than the active method, and the email
/// account section an explicit provider does not use.
fn prune_unused_sections(root: &mut Value) {
    if let Some(notifications) = root.get_mut("notifications").and_then(Value::as_mapping_mut) {
        let method = notifications
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_lowercase);
        if let Some(method) = method {
            for section in ["pushover", "email", "sms", "whatsapp"] {
                if section != method {
                    notifications.remove(section);
                }
            }
        }
    }

    if let Some(email) = root.get_mut("email").and_then(Value::as_mapping_mut) {
        let provider = email
            .get("provider")
            .and_then(Value::as_str)
            .map(str::to_lowercase);
        match provider.as_deref() {
            Some("gmail") => {
                email.remove("other");
            }
            Some("other") => {
                email.remove("gmail");
            }
            _ => {}
        }
    }
}

/// Replace `${NAME}` in every string value of the tree.
fn resolve_placeholders<F>(
    value: &mut Value,
    pattern: &Regex,
    lookup: &F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) if s.contains("${") => {
            *s = substitute(s, pattern, lookup)?;
        }
        Value::Sequence(items) => {
            for item in items {
                resolve_placeholders(item, pattern, lookup)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                resolve_placeholders(item, pattern, lookup)?;
            }
        }
        Value::Tagged(tagged) => resolve_placeholders(&mut tagged.value, pattern, lookup)?,
        _ => {}
    }
    Ok(())
}

fn substitute<F>(text: &str, pattern: &Regex, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in pattern.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let resolved = lookup(name.as_str())
            .ok_or_else(|| ConfigError::MissingEnvVar(name.as_str().to_string()))?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&resolved);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

fn resolve_mailbox(
    choice: ProviderChoice,
    gmail: Option<RawImapAccount>,
    other: Option<RawImapAccount>,
) -> Result<ImapConfig, ConfigError> {
    let provider = match choice {
        ProviderChoice::Gmail => MailProvider::Gmail,
        ProviderChoice::Other => MailProvider::Other,
        ProviderChoice::Auto => {
            let username = other
                .as_ref()
                .or(gmail.as_ref())
                .map(|a| a.username.to_lowercase())
                .unwrap_or_default();
            if username.ends_with("@gmail.com") {
                MailProvider::Gmail
            } else {
                MailProvider::Other
            }
        }
    };

    // Auto-detected Gmail may be configured under either section.
    let account = match provider {
        MailProvider::Gmail => gmail.or(other),
        MailProvider::Other => other,
    }
    .ok_or_else(|| {
        let key = match provider {
            MailProvider::Gmail => "email.gmail",
            MailProvider::Other => "email.other",
        };
        missing(key, "Add the IMAP account for the selected provider")
    })?;

    if account.username.trim().is_empty() {
        return Err(missing("email.username", "IMAP username must not be empty"));
    }

    let server = match (provider, account.imap_server) {
        (_, Some(server)) if !server.trim().is_empty() => server,
        (MailProvider::Gmail, _) => GMAIL_IMAP_SERVER.to_string(),
        (MailProvider::Other, _) => {
            return Err(missing("email.other.imap_server", "Set the IMAP host"));
        }
    };

    Ok(ImapConfig {
        provider,
        server,
        port: account.port.unwrap_or(IMAPS_PORT),
        username: account.username,
        password: account.password,
        mailbox: account.mailbox.unwrap_or_else(|| "INBOX".to_string()),
        processed_marker: None,
    })
}

fn convert_labels(raw: Vec<RawLabel>) -> Result<Vec<LabelRule>, ConfigError> {
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(raw.len());

    for label in raw {
        let name = label.name.trim().to_string();
        if name.is_empty() {
            return Err(invalid("labels.name", "label names must not be empty"));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(invalid("labels.name", format!("duplicate label '{name}'")));
        }

        let criteria = label.criteria;
        let rule = LabelRule {
            name,
            from: criteria.from,
            from_name: criteria.from_name,
            from_domain: criteria.from_domain,
            subject_contains: criteria.subject_contains,
            body_contains: criteria.body_contains,
            notify: label.notify.or(criteria.notify).unwrap_or(false),
        };
        if !rule.has_criteria() {
            return Err(invalid(
                "labels.criteria",
                format!("label '{}' has no criteria", rule.name),
            ));
        }
        rules.push(rule);
    }

    Ok(rules)
}

fn convert_notifications(raw: RawNotifications) -> Result<NotificationChannel, ConfigError> {
    match raw.method {
        ChannelKind::Pushover => {
            let cfg: PushoverConfig = section(raw.pushover, "notifications.pushover")?;
            Ok(NotificationChannel::Pushover(cfg))
        }
        ChannelKind::Email => {
            let cfg: SmtpNotifyConfig = section(raw.email, "notifications.email")?;
            Ok(NotificationChannel::Email(cfg))
        }
        ChannelKind::Sms => Ok(NotificationChannel::Sms(twilio_section(
            raw.sms,
            "notifications.sms",
        )?)),
        ChannelKind::WhatsApp => Ok(NotificationChannel::WhatsApp(twilio_section(
            raw.whatsapp,
            "notifications.whatsapp",
        )?)),
    }
}

fn section<T>(value: Option<Value>, key: &str) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned,
{
    let value = value.ok_or_else(|| missing(key, "Required by notifications.method"))?;
    serde_yaml::from_value(value).map_err(|e| invalid(key, e.to_string()))
}

fn twilio_section(raw: Option<RawTwilioSection>, key: &str) -> Result<TwilioConfig, ConfigError> {
    let raw = raw.ok_or_else(|| missing(key, "Required by notifications.method"))?;
    if !raw.provider.eq_ignore_ascii_case("twilio") {
        return Err(invalid(
            &format!("{key}.provider"),
            format!("unsupported provider '{}', only twilio is available", raw.provider),
        ));
    }
    section(raw.twilio, &format!("{key}.twilio"))
}
