//! Label classification: deterministic rules first, LLM fallback second.
//!
//! The LLM is consulted only when no rule matched. Its suggestions are
//! constrained to configured label names, and notification is decided from
//! the rule table, so an LLM label notifies only if its rule says so.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::{LlmClassifier, LlmVerdict};
use crate::pipeline::rules::{LabelRule, match_reason};
use crate::pipeline::types::{ClassificationResult, LabelSource, Message};

/// Default per-call timeout for the LLM fallback.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(20);

/// Classification plus any retryable warning raised by the LLM fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub result: ClassificationResult,
    pub warning: Option<String>,
}

/// Runs every label rule over a message and merges in LLM suggestions.
pub struct LabelClassifier {
    rules: Vec<LabelRule>,
    label_names: Vec<String>,
    llm: Option<Arc<dyn LlmClassifier>>,
    llm_timeout: Duration,
}

impl LabelClassifier {
    /// Rule-only classifier.
    pub fn new(rules: Vec<LabelRule>) -> Self {
        let label_names = rules.iter().map(|r| r.name.clone()).collect();
        Self {
            rules,
            label_names,
            llm: None,
            llm_timeout: DEFAULT_LLM_TIMEOUT,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClassifier>, timeout: Duration) -> Self {
        self.llm = Some(llm);
        self.llm_timeout = timeout;
        self
    }

    pub fn rules(&self) -> &[LabelRule] {
        &self.rules
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Classify one message. Never fails: LLM errors degrade to no labels.
    pub async fn classify(&self, message: &Message) -> Classified {
        let mut result = self.classify_by_rules(message);
        let mut warning = None;

        if result.is_empty()
            && let Some(llm) = &self.llm
        {
            match self.ask_llm(llm.as_ref(), message).await {
                Ok(LlmVerdict::Labels(names)) => {
                    for name in names {
                        result.push(name, LabelSource::Llm);
                    }
                    debug!(
                        id = %message.id,
                        labels = ?result.label_names(),
                        "LLM fallback labelled message"
                    );
                }
                Ok(LlmVerdict::Unclassifiable) => {
                    debug!(id = %message.id, "LLM reported message unclassifiable");
                }
                Err(e) => {
                    warn!(
                        id = %message.id,
                        provider = llm.name(),
                        error = %e,
                        "LLM classification failed, continuing without labels"
                    );
                    result = ClassificationResult::empty();
                    warning = Some(e.to_string());
                }
            }
        }

        result.should_notify = self.should_notify(&result);
        Classified { result, warning }
    }

    /// Rule pass only, in declaration order.
    pub fn classify_by_rules(&self, message: &Message) -> ClassificationResult {
        let mut result = ClassificationResult::empty();
        for rule in &self.rules {
            if let Some(by) = match_reason(message, rule) {
                debug!(
                    id = %message.id,
                    label = %rule.name,
                    matched_by = ?by,
                    "Message matched label rule"
                );
                result.push(rule.name.clone(), LabelSource::Rule);
            }
        }
        result.should_notify = self.should_notify(&result);
        result
    }

    fn should_notify(&self, result: &ClassificationResult) -> bool {
        result.labels.iter().any(|label| {
            self.rules
                .iter()
                .any(|rule| rule.name == label.name && rule.notify)
        })
    }

    async fn ask_llm(
        &self,
        llm: &dyn LlmClassifier,
        message: &Message,
    ) -> Result<LlmVerdict, LlmError> {
        let call = llm.classify(&message.subject, &message.body_preview, &self.label_names);
        match tokio::time::timeout(self.llm_timeout, call).await {
            Ok(verdict) => verdict.map(|v| self.constrain(v)),
            Err(_) => Err(LlmError::Timeout {
                provider: llm.name().to_string(),
                timeout: self.llm_timeout,
            }),
        }
    }

    /// Drop any name the collaborator returned that is not a configured label.
    fn constrain(&self, verdict: LlmVerdict) -> LlmVerdict {
        match verdict {
            LlmVerdict::Labels(names) => LlmVerdict::Labels(
                names
                    .into_iter()
                    .filter(|n| self.label_names.contains(n))
                    .collect(),
            ),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock LLM returning a fixed verdict and counting calls.
    struct MockLlm {
        verdict: Result<LlmVerdict, String>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl MockLlm {
        fn returning(verdict: LlmVerdict) -> Self {
            Self {
                verdict: Ok(verdict),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(reason: &str) -> Self {
            Self {
                verdict: Err(reason.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClassifier for MockLlm {
        fn name(&self) -> &str {
            "mock"
        }

        async fn classify(
            &self,
            _subject: &str,
            _body_preview: &str,
            _candidates: &[String],
        ) -> Result<LlmVerdict, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.verdict
                .clone()
                .map_err(|reason| LlmError::InvalidResponse {
                    provider: "mock".into(),
                    reason,
                })
        }
    }

    fn rules() -> Vec<LabelRule> {
        vec![
            LabelRule::new("Important")
                .with_from(&["boss@company.com"])
                .with_subject_contains(&["urgent"])
                .with_notify(true),
            LabelRule::new("Work").with_from_domain(&["company.com"]),
        ]
    }

    fn make_message(from: &str, subject: &str) -> Message {
        Message::new("m-1", from, subject, "body", Utc::now(), false)
    }

    #[tokio::test]
    async fn boss_urgent_is_important_and_notifies() {
        let classifier = LabelClassifier::new(rules());
        let out = classifier
            .classify(&make_message("boss@company.com", "Urgent meeting"))
            .await;
        assert!(out.result.contains("Important"));
        assert!(out.result.should_notify);
        assert!(out.warning.is_none());
    }

    #[tokio::test]
    async fn work_only_does_not_notify() {
        let classifier = LabelClassifier::new(rules());
        let out = classifier
            .classify(&make_message("someone@company.com", "project kickoff meeting"))
            .await;
        assert_eq!(out.result.label_names(), vec!["Work".to_string()]);
        assert!(!out.result.should_notify);
    }

    #[tokio::test]
    async fn multiple_labels_in_declaration_order_notify_is_or() {
        let classifier = LabelClassifier::new(rules());
        let out = classifier
            .classify(&make_message("boss@company.com", "hi"))
            .await;
        assert_eq!(
            out.result.label_names(),
            vec!["Important".to_string(), "Work".to_string()]
        );
        assert!(out.result.should_notify);
        assert_eq!(out.result.source_of("Work"), Some(LabelSource::Rule));
    }

    #[tokio::test]
    async fn no_llm_no_match_is_empty() {
        let classifier = LabelClassifier::new(rules());
        let out = classifier
            .classify(&make_message("friend@example.com", "Hello"))
            .await;
        assert!(out.result.is_empty());
        assert!(!out.result.should_notify);
    }

    #[tokio::test]
    async fn llm_not_consulted_when_rule_matches() {
        let llm = Arc::new(MockLlm::returning(LlmVerdict::Labels(vec!["Important".into()])));
        let classifier =
            LabelClassifier::new(rules()).with_llm(llm.clone(), Duration::from_secs(1));
        let out = classifier
            .classify(&make_message("x@company.com", "status"))
            .await;
        assert_eq!(out.result.label_names(), vec!["Work".to_string()]);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn llm_labels_are_tagged_and_use_rule_notify_flag() {
        let llm = Arc::new(MockLlm::returning(LlmVerdict::Labels(vec![
            "Important".into(),
            "Made Up".into(),
        ])));
        let classifier = LabelClassifier::new(rules()).with_llm(llm, Duration::from_secs(1));
        let out = classifier
            .classify(&make_message("friend@example.com", "Hello"))
            .await;
        assert_eq!(out.result.label_names(), vec!["Important".to_string()]);
        assert_eq!(out.result.source_of("Important"), Some(LabelSource::Llm));
        assert!(out.result.should_notify);
    }

    #[tokio::test]
    async fn llm_label_without_notify_rule_does_not_notify() {
        let llm = Arc::new(MockLlm::returning(LlmVerdict::Labels(vec!["Work".into()])));
        let classifier = LabelClassifier::new(rules()).with_llm(llm, Duration::from_secs(1));
        let out = classifier
            .classify(&make_message("friend@example.com", "Hello"))
            .await;
        assert!(out.result.contains("Work"));
        assert!(!out.result.should_notify);
    }

    #[tokio::test]
    async fn unclassifiable_yields_empty_result() {
        let llm = Arc::new(MockLlm::returning(LlmVerdict::Unclassifiable));
        let classifier = LabelClassifier::new(rules()).with_llm(llm, Duration::from_secs(1));
        let out = classifier
            .classify(&make_message("friend@example.com", "Hello"))
            .await;
        assert!(out.result.is_empty());
        assert!(!out.result.should_notify);
        assert!(out.warning.is_none());
    }

    #[tokio::test]
    async fn llm_failure_falls_back_with_warning() {
        let llm = Arc::new(MockLlm::failing("garbage"));
        let classifier = LabelClassifier::new(rules()).with_llm(llm, Duration::from_secs(1));
        let out = classifier
            .classify(&make_message("friend@example.com", "Hello"))
            .await;
        assert!(out.result.is_empty());
        assert!(!out.result.should_notify);
        assert!(out.warning.unwrap().contains("garbage"));
    }

    #[tokio::test(start_paused = true)]
    async fn llm_timeout_falls_back_with_warning() {
        let llm = Arc::new(MockLlm {
            verdict: Ok(LlmVerdict::Labels(vec!["Important".into()])),
            delay: Duration::from_secs(60),
            calls: AtomicUsize::new(0),
        });
        let classifier = LabelClassifier::new(rules()).with_llm(llm, Duration::from_secs(2));
        let out = classifier
            .classify(&make_message("friend@example.com", "Hello"))
            .await;
        assert!(out.result.is_empty());
        assert!(out.warning.unwrap().contains("timed out"));
    }
}
