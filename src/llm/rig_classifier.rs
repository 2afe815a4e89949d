//! rig-core backed [`LlmClassifier`].

use async_trait::async_trait;
use rig::agent::Agent;
use rig::completion::{CompletionModel, Prompt};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::prompt::{build_user_prompt, parse_verdict};
use crate::llm::{LlmClassifier, LlmVerdict};

/// Classifier driving a rig agent whose preamble is the labelling prompt.
pub struct RigLlmClassifier<M: CompletionModel> {
    agent: Agent<M>,
    provider: String,
}

impl<M: CompletionModel> RigLlmClassifier<M> {
    pub fn new(agent: Agent<M>, provider: &str) -> Self {
        Self {
            agent,
            provider: provider.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmClassifier for RigLlmClassifier<M>
where
    M: CompletionModel + 'static,
{
    fn name(&self) -> &str {
        &self.provider
    }

    async fn classify(
        &self,
        subject: &str,
        body_preview: &str,
        candidates: &[String],
    ) -> Result<LlmVerdict, LlmError> {
        let user_prompt = build_user_prompt(subject, body_preview, candidates);

        let raw: String =
            self.agent
                .prompt(user_prompt)
                .await
                .map_err(|e| LlmError::RequestFailed {
                    provider: self.provider.clone(),
                    reason: e.to_string(),
                })?;

        debug!(provider = %self.provider, "Classification response received");

        parse_verdict(&raw, candidates).map_err(|reason| {
            warn!(raw_response = %raw, error = %reason, "Failed to parse classification response");
            LlmError::InvalidResponse {
                provider: self.provider.clone(),
                reason,
            }
        })
    }
}
