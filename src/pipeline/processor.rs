//! Processing pipeline: classifies, cleans and notifies, one message at a time.
//!
//! Per message the states are strictly ordered:
//! `Fetched → Classified → CleaningEvaluated → Dispatched → Recorded`.
//! A message that cannot finish lands in `Failed` and is retried next cycle.
//! That includes a message whose LLM call failed, up to `llm_retry_cycles`
//! times, after which it is settled with whatever the rules produced.
//!
//! Actions run label, notify, delete. A finished message still in the
//! mailbox gets the processed marker before it is recorded.
//!
//! Messages within a cycle run concurrently up to `max_concurrency`. The
//! ledger claim makes sure no id is processed twice, even across passes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{MailboxError, PipelineError};
use crate::notify::NotificationRouter;
use crate::pipeline::classifier::LabelClassifier;
use crate::pipeline::cleaning::CleaningPolicy;
use crate::pipeline::ledger::{Claim, ProcessedLedger};
use crate::pipeline::types::{
    ClassificationResult, CleaningDecision, Deleter, LabelApplier, Message, MessageFetcher,
    ProcessedMarker,
};
use crate::retry::RetryPolicy;

/// Default number of messages processed at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default per-call timeout for label/delete actions.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of cycles a message waits for a failing LLM.
pub const DEFAULT_LLM_RETRY_CYCLES: u32 = 3;

// ── Outcome types ───────────────────────────────────────────────────

/// Where a message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Fetched,
    Classified,
    CleaningEvaluated,
    Dispatched,
    Recorded,
    Failed,
}

/// External action attempted for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Classify,
    LabelApply,
    Notify,
    Delete,
    MarkProcessed,
    Record,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::LabelApply => "label_apply",
            Self::Notify => "notify",
            Self::Delete => "delete",
            Self::MarkProcessed => "mark_processed",
            Self::Record => "record",
        }
    }
}

/// One failed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionFailure {
    pub action: ActionKind,
    pub message_id: String,
    pub reason: String,
    pub attempts: u32,
    /// Attempts exhausted; the message will not be retried for this action.
    /// For `Classify`, `attempts` counts cycles rather than calls.
    pub permanent: bool,
}

/// Everything that happened to one message in a pass.
#[derive(Debug, Clone, Serialize)]
pub struct MessageOutcome {
    pub message_id: String,
    pub state: MessageState,
    pub classification: ClassificationResult,
    pub cleaning: CleaningDecision,
    pub labeled: bool,
    pub deleted: bool,
    pub notified: bool,
    pub failures: Vec<ActionFailure>,
    /// Retryable LLM warning, if the fallback failed.
    pub llm_warning: Option<String>,
}

impl MessageOutcome {
    fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            state: MessageState::Fetched,
            classification: ClassificationResult::empty(),
            cleaning: CleaningDecision::keep(),
            labeled: false,
            deleted: false,
            notified: false,
            failures: Vec::new(),
            llm_warning: None,
        }
    }

    /// Short summary stored alongside the ledger entry.
    fn ledger_summary(&self) -> String {
        if self.failures.is_empty() {
            "ok".to_string()
        } else {
            let actions: Vec<&str> = self.failures.iter().map(|f| f.action.label()).collect();
            format!("partial:{}", actions.join(","))
        }
    }
}

/// Per-message result of a cycle.
#[derive(Debug, Clone)]
pub enum Processed {
    Outcome(MessageOutcome),
    /// Id already recorded or in flight elsewhere.
    Duplicate(String),
    /// Shutdown was requested before the message started.
    NotStarted(String),
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<MessageOutcome>,
    pub duplicates: Vec<String>,
    pub not_started: Vec<String>,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            outcomes: Vec::new(),
            duplicates: Vec::new(),
            not_started: Vec::new(),
        }
    }

    pub fn recorded(&self) -> usize {
        self.count_state(MessageState::Recorded)
    }

    pub fn failed(&self) -> usize {
        self.count_state(MessageState::Failed)
    }

    fn count_state(&self, state: MessageState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    /// All action failures across every message.
    pub fn failures(&self) -> impl Iterator<Item = &ActionFailure> {
        self.outcomes.iter().flat_map(|o| o.failures.iter())
    }

    pub fn outcome(&self, message_id: &str) -> Option<&MessageOutcome> {
        self.outcomes.iter().find(|o| o.message_id == message_id)
    }

    pub fn deleted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.deleted).count()
    }

    pub fn notified(&self) -> usize {
        self.outcomes.iter().filter(|o| o.notified).count()
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Tunables for a pipeline pass.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub max_concurrency: usize,
    pub action_timeout: Duration,
    pub retry: RetryPolicy,
    /// Cycles an LLM-dependent message is deferred before it is settled
    /// without labels.
    pub llm_retry_cycles: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            retry: RetryPolicy::default(),
            llm_retry_cycles: DEFAULT_LLM_RETRY_CYCLES,
        }
    }
}

/// Orchestrates classification, cleaning and notification per message.
pub struct ProcessingPipeline {
    classifier: LabelClassifier,
    cleaning: CleaningPolicy,
    router: Option<NotificationRouter>,
    labels: Arc<dyn LabelApplier>,
    deleter: Arc<dyn Deleter>,
    marker: Option<Arc<dyn ProcessedMarker>>,
    ledger: Arc<ProcessedLedger>,
    /// LLM failures per message id, cleared once the id is recorded.
    llm_failures: Mutex<HashMap<String, u32>>,
    config: PipelineConfig,
}

impl ProcessingPipeline {
    pub fn new(
        classifier: LabelClassifier,
        cleaning: CleaningPolicy,
        labels: Arc<dyn LabelApplier>,
        deleter: Arc<dyn Deleter>,
        ledger: Arc<ProcessedLedger>,
    ) -> Self {
        Self {
            classifier,
            cleaning,
            router: None,
            labels,
            deleter,
            marker: None,
            ledger,
            llm_failures: Mutex::new(HashMap::new()),
            config: PipelineConfig::default(),
        }
    }

    pub fn with_router(mut self, router: NotificationRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Mark finished messages on the server so later fetches skip them.
    pub fn with_marker(mut self, marker: Arc<dyn ProcessedMarker>) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ledger(&self) -> &ProcessedLedger {
        &self.ledger
    }

    /// Fetch and process one cycle.
    ///
    /// A fetch failure aborts only this cycle.
    pub async fn run_once(
        &self,
        fetcher: &dyn MessageFetcher,
        since: Option<DateTime<Utc>>,
        shutdown: &AtomicBool,
    ) -> Result<CycleReport, PipelineError> {
        let messages = fetcher.fetch(since).await?;
        info!(count = messages.len(), since = ?since, "Fetched messages");
        Ok(self.run_cycle(messages, Utc::now(), shutdown).await)
    }

    /// Process a batch of messages. Individual failures never fail the batch.
    ///
    /// `now` is fixed for the whole cycle so age checks agree across messages.
    pub async fn run_cycle(
        &self,
        messages: Vec<Message>,
        now: DateTime<Utc>,
        shutdown: &AtomicBool,
    ) -> CycleReport {
        let mut report = CycleReport::new(now);
        let concurrency = self.config.max_concurrency.max(1);

        let results: Vec<Processed> = futures::stream::iter(messages)
            .map(|message| self.process(message, now, shutdown))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                Processed::Outcome(outcome) => report.outcomes.push(outcome),
                Processed::Duplicate(id) => report.duplicates.push(id),
                Processed::NotStarted(id) => report.not_started.push(id),
            }
        }

        info!(
            run_id = %report.run_id,
            recorded = report.recorded(),
            failed = report.failed(),
            duplicates = report.duplicates.len(),
            not_started = report.not_started.len(),
            deleted = report.deleted(),
            notified = report.notified(),
            "Cycle complete"
        );
        report
    }

    /// Run one message through the state machine.
    pub async fn process(
        &self,
        message: Message,
        now: DateTime<Utc>,
        shutdown: &AtomicBool,
    ) -> Processed {
        if shutdown.load(Ordering::Relaxed) {
            return Processed::NotStarted(message.id);
        }

        match self.ledger.try_claim(&message.id) {
            Claim::Claimed => {}
            Claim::AlreadyProcessed | Claim::InFlight => {
                debug!(id = %message.id, "Skipping already handled message");
                return Processed::Duplicate(message.id);
            }
        }

        let mut outcome = MessageOutcome::new(&message.id);

        // Fetched → Classified
        let classified = self.classifier.classify(&message).await;
        outcome.classification = classified.result;
        outcome.llm_warning = classified.warning;
        outcome.state = MessageState::Classified;

        // Classified → CleaningEvaluated
        outcome.cleaning = self.cleaning.evaluate(&message, now);
        outcome.state = MessageState::CleaningEvaluated;

        if let Some(warning) = outcome.llm_warning.clone() {
            let failures = self.note_llm_failure(&message.id);
            let settle = failures >= self.config.llm_retry_cycles;
            outcome.failures.push(ActionFailure {
                action: ActionKind::Classify,
                message_id: message.id.clone(),
                reason: warning,
                attempts: failures,
                permanent: settle,
            });
            if !settle {
                // No action has run yet.
                warn!(
                    id = %message.id,
                    cycles = failures,
                    "LLM unavailable, deferring message to next cycle"
                );
                return Processed::Outcome(self.fail(outcome));
            }
            error!(
                id = %message.id,
                cycles = failures,
                "LLM kept failing, settling message without labels"
            );
        }

        info!(
            id = %message.id,
            sender = %message.sender,
            labels = ?outcome.classification.label_names(),
            notify = outcome.classification.should_notify,
            delete = outcome.cleaning.delete,
            reason = outcome.cleaning.reason.map(|r| r.code()).unwrap_or("none"),
            "Message evaluated"
        );

        // CleaningEvaluated → Dispatched
        if let Err(e) = self.dispatch(&message, &mut outcome, shutdown).await {
            warn!(id = %message.id, error = %e, "Message processing interrupted");
            return Processed::Outcome(self.fail(outcome));
        }
        outcome.state = MessageState::Dispatched;

        // Dispatched → Recorded
        self.mark(&message, &mut outcome).await;
        if let Err(e) = self.commit(&message.id, &outcome).await {
            error!(id = %message.id, error = %e, "Failed to record message in ledger");
            outcome.failures.push(ActionFailure {
                action: ActionKind::Record,
                message_id: message.id.clone(),
                reason: e.to_string(),
                attempts: 1,
                permanent: false,
            });
            return Processed::Outcome(self.fail(outcome));
        }
        outcome.state = MessageState::Recorded;

        Processed::Outcome(outcome)
    }

    fn fail(&self, mut outcome: MessageOutcome) -> MessageOutcome {
        self.ledger.release(&outcome.message_id);
        outcome.state = MessageState::Failed;
        outcome
    }

    /// Count one more LLM failure for `message_id` and return the total.
    fn note_llm_failure(&self, message_id: &str) -> u32 {
        let mut failures = self
            .llm_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = failures.entry(message_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    async fn commit(
        &self,
        message_id: &str,
        outcome: &MessageOutcome,
    ) -> Result<(), PipelineError> {
        self.ledger
            .record(message_id, &outcome.ledger_summary())
            .await?;
        self.llm_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(message_id);
        Ok(())
    }

    /// Attempt label, notify and delete in that order. Each failure is
    /// recorded separately; successes are never rolled back.
    ///
    /// Shutdown is honoured only while a rerun would be harmless. Once the
    /// notification went out or the message is gone from the server, the
    /// remaining actions always run.
    async fn dispatch(
        &self,
        message: &Message,
        outcome: &mut MessageOutcome,
        shutdown: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let names = outcome.classification.label_names();
        if !names.is_empty() {
            let attempted = self
                .config
                .retry
                .run(
                    ActionKind::LabelApply.label(),
                    self.config.action_timeout,
                    || self.labels.apply(&message.id, &names),
                    MailboxError::Timeout,
                )
                .await;
            match attempted.result {
                Ok(()) => outcome.labeled = true,
                Err(e) => outcome.failures.push(self.permanent_failure(
                    ActionKind::LabelApply,
                    &message.id,
                    e.to_string(),
                    attempted.attempts,
                )),
            }
            check_shutdown(shutdown)?;
        }

        match &self.router {
            Some(router) => {
                if let Some(event) = router.route(message, &outcome.classification) {
                    let attempted = router.dispatch(&event).await;
                    match attempted.result {
                        Ok(()) => outcome.notified = true,
                        Err(e) => outcome.failures.push(self.permanent_failure(
                            ActionKind::Notify,
                            &message.id,
                            e.to_string(),
                            attempted.attempts,
                        )),
                    }
                }
            }
            None if outcome.classification.should_notify => {
                warn!(id = %message.id, "Notification wanted but no channel is configured");
            }
            None => {}
        }

        if !outcome.notified {
            check_shutdown(shutdown)?;
        }

        if outcome.cleaning.delete {
            let attempted = self
                .config
                .retry
                .run(
                    ActionKind::Delete.label(),
                    self.config.action_timeout,
                    || self.deleter.delete(&message.id),
                    MailboxError::Timeout,
                )
                .await;
            match attempted.result {
                Ok(()) => outcome.deleted = true,
                Err(e) => outcome.failures.push(self.permanent_failure(
                    ActionKind::Delete,
                    &message.id,
                    e.to_string(),
                    attempted.attempts,
                )),
            }
        }

        Ok(())
    }

    /// Leave the processed marker on a message that is still in the mailbox.
    async fn mark(&self, message: &Message, outcome: &mut MessageOutcome) {
        let Some(marker) = &self.marker else {
            return;
        };
        if outcome.deleted {
            return;
        }
        let attempted = self
            .config
            .retry
            .run(
                ActionKind::MarkProcessed.label(),
                self.config.action_timeout,
                || marker.mark_processed(&message.id),
                MailboxError::Timeout,
            )
            .await;
        if let Err(e) = attempted.result {
            outcome.failures.push(self.permanent_failure(
                ActionKind::MarkProcessed,
                &message.id,
                e.to_string(),
                attempted.attempts,
            ));
        }
    }

    fn permanent_failure(
        &self,
        action: ActionKind,
        message_id: &str,
        reason: String,
        attempts: u32,
    ) -> ActionFailure {
        error!(
            id = %message_id,
            action = action.label(),
            attempts,
            error = %reason,
            "Action failed permanently"
        );
        ActionFailure {
            action,
            message_id: message_id.to_string(),
            reason,
            attempts,
            permanent: true,
        }
    }
}

fn check_shutdown(shutdown: &AtomicBool) -> Result<(), PipelineError> {
    if shutdown.load(Ordering::Relaxed) {
        return Err(PipelineError::Interrupted);
    }
    Ok(())
}
