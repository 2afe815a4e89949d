//! LLM fallback classification.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! The pipeline only sees the [`LlmClassifier`] capability; the rig-backed
//! implementation lives in `rig_classifier` and prompt/response handling in
//! `prompt`.

pub mod prompt;
mod rig_classifier;

pub use rig_classifier::RigLlmClassifier;

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::error::LlmError;

/// Verdict returned by an LLM classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmVerdict {
    /// Zero or more label names, all drawn from the candidate set.
    Labels(Vec<String>),
    /// The model could not place the message in any category.
    Unclassifiable,
}

/// Single-method capability for LLM-based label suggestion.
#[async_trait]
pub trait LlmClassifier: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Suggest labels for a message from `candidates`.
    async fn classify(
        &self,
        subject: &str,
        body_preview: &str,
        candidates: &[String],
    ) -> Result<LlmVerdict, LlmError>;
}

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    Anthropic,
    #[serde(alias = "open_ai")]
    OpenAi,
}

/// Configuration for creating an LLM classifier.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create an LLM classifier from configuration.
pub fn create_classifier(config: &LlmConfig) -> Result<Arc<dyn LlmClassifier>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_classifier(config),
        LlmBackend::OpenAi => create_openai_classifier(config),
    }
}

fn create_anthropic_classifier(config: &LlmConfig) -> Result<Arc<dyn LlmClassifier>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(prompt::SYSTEM_PROMPT)
        .temperature(prompt::CLASSIFY_TEMPERATURE)
        .max_tokens(prompt::CLASSIFY_MAX_TOKENS)
        .build();
    tracing::info!("Using Anthropic classifier (model: {})", config.model);
    Ok(Arc::new(RigLlmClassifier::new(agent, "anthropic")))
}

fn create_openai_classifier(config: &LlmConfig) -> Result<Arc<dyn LlmClassifier>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(prompt::SYSTEM_PROMPT)
        .temperature(prompt::CLASSIFY_TEMPERATURE)
        .max_tokens(prompt::CLASSIFY_MAX_TOKENS)
        .build();
    tracing::info!("Using OpenAI classifier (model: {})", config.model);
    Ok(Arc::new(RigLlmClassifier::new(agent, "openai")))
}
