//! End-to-end pipeline tests against mock collaborators.
//!
//! Wires config → classifier → cleaning → router → ledger through the public
//! API and checks the observable side effects of whole cycles.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mail_agent::config::AppConfig;
use mail_agent::error::{ChannelError, LlmError, MailboxError};
use mail_agent::llm::{LlmClassifier, LlmVerdict};
use mail_agent::notify::{ChannelKind, NotificationEvent, NotificationRouter, NotificationSender};
use mail_agent::pipeline::processor::{ActionKind, MessageState};
use mail_agent::pipeline::types::{Deleter, LabelApplier, LabelSource, ProcessedMarker};
use mail_agent::pipeline::{
    CleaningPolicy, LabelClassifier, LedgerStore, Message, MessageFetcher, ProcessedLedger,
    ProcessingPipeline,
};
use mail_agent::retry::RetryPolicy;
use mail_agent::store::LibSqlLedgerStore;

// ── Mocks ───────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeMailbox {
    inbox: Mutex<Vec<Message>>,
    labels: Mutex<Vec<(String, Vec<String>)>>,
    deleted: Mutex<Vec<String>>,
    marked: Mutex<HashSet<String>>,
    label_failures: AtomicU32,
}

impl FakeMailbox {
    fn with_inbox(messages: Vec<Message>) -> Self {
        Self {
            inbox: Mutex::new(messages),
            ..Default::default()
        }
    }

    fn fail_labels(&self, times: u32) {
        self.label_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageFetcher for FakeMailbox {
    async fn fetch(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<Message>, MailboxError> {
        let marked = self.marked.lock().unwrap();
        Ok(self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| !marked.contains(&m.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProcessedMarker for FakeMailbox {
    async fn mark_processed(&self, message_id: &str) -> Result<(), MailboxError> {
        self.marked.lock().unwrap().insert(message_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl LabelApplier for FakeMailbox {
    async fn apply(&self, message_id: &str, labels: &[String]) -> Result<(), MailboxError> {
        let remaining = self.label_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.label_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(MailboxError::Protocol("STORE failed".into()));
        }
        self.labels
            .lock()
            .unwrap()
            .push((message_id.to_string(), labels.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl Deleter for FakeMailbox {
    async fn delete(&self, message_id: &str) -> Result<(), MailboxError> {
        self.inbox.lock().unwrap().retain(|m| m.id != message_id);
        self.deleted.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct OutboxSender {
    sent: Mutex<Vec<NotificationEvent>>,
    down: AtomicBool,
}

#[async_trait]
impl NotificationSender for OutboxSender {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Pushover
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ChannelError::Http("connection refused".into()));
        }
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Returns `verdict`, except the first `outage` calls fail.
struct ScriptedLlm {
    verdict: Result<LlmVerdict, String>,
    outage: u32,
    calls: AtomicU32,
}

impl ScriptedLlm {
    fn new(verdict: Result<LlmVerdict, String>) -> Self {
        Self::recovering_after(0, verdict)
    }

    fn recovering_after(outage: u32, verdict: Result<LlmVerdict, String>) -> Self {
        Self {
            verdict,
            outage,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LlmClassifier for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(
        &self,
        _subject: &str,
        _body_preview: &str,
        _candidates: &[String],
    ) -> Result<LlmVerdict, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let verdict = if call < self.outage {
            Err("503 service unavailable".to_string())
        } else {
            self.verdict.clone()
        };
        verdict.map_err(|reason| LlmError::RequestFailed {
            provider: "scripted".into(),
            reason,
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

const CONFIG: &str = r#"
email:
  provider: gmail
  gmail:
    username: agent@gmail.com
    password: ${APP_PASSWORD}
labels:
  - name: Important
    criteria:
      from: [boss@company.com]
      subject_contains: [urgent]
    notify: true
  - name: Work
    criteria:
      from_domain: [company.com]
  - name: Finance
    criteria:
      subject_contains: [invoice]
  - name: Travel
    criteria:
      body_contains: [boarding pass]
  - name: Payroll
    criteria:
      from_name: [payroll]
cleaning:
  delete_newsletters: true
  newsletter_domains: [newsletter.com]
  delete_older_than: 30
  delete_read: false
notifications:
  method: pushover
  pushover:
    user_key: u
    api_token: t
processing:
  max_concurrency: 3
  max_attempts: 2
  retry_backoff_ms: 0
"#;

fn config() -> AppConfig {
    AppConfig::from_yaml_str(CONFIG, |name| {
        (name == "APP_PASSWORD").then(|| "app-pass".to_string())
    })
    .unwrap()
}

fn message(id: &str, from: &str, subject: &str, age_days: i64, read: bool) -> Message {
    Message::new(
        id,
        from,
        subject,
        "body",
        Utc::now() - chrono::Duration::days(age_days),
        read,
    )
}

struct Harness {
    pipeline: ProcessingPipeline,
    mailbox: Arc<FakeMailbox>,
    outbox: Arc<OutboxSender>,
}

fn harness(
    cfg: &AppConfig,
    mailbox: FakeMailbox,
    llm: Option<Arc<dyn LlmClassifier>>,
    ledger: ProcessedLedger,
) -> Harness {
    harness_on(cfg, Arc::new(mailbox), llm, ledger)
}

/// Harness over an existing mailbox, so a restarted agent sees the same server.
fn harness_on(
    cfg: &AppConfig,
    mailbox: Arc<FakeMailbox>,
    llm: Option<Arc<dyn LlmClassifier>>,
    ledger: ProcessedLedger,
) -> Harness {
    let outbox = Arc::new(OutboxSender::default());

    let mut classifier = LabelClassifier::new(cfg.labels.clone());
    if let Some(llm) = llm {
        classifier = classifier.with_llm(llm, Duration::from_secs(1));
    }

    let channel = cfg.notifications.clone().unwrap();
    let router = NotificationRouter::new(channel, outbox.clone())
        .with_retry(RetryPolicy::new(2, Duration::ZERO));

    let pipeline = ProcessingPipeline::new(
        classifier,
        CleaningPolicy::new(cfg.cleaning.clone()),
        mailbox.clone(),
        mailbox.clone(),
        Arc::new(ledger),
    )
    .with_router(router)
    .with_marker(mailbox.clone())
    .with_config(cfg.processing.pipeline_config());

    Harness {
        pipeline,
        mailbox,
        outbox,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn mixed_inbox_single_cycle() {
    let cfg = config();
    let h = harness(
        &cfg,
        FakeMailbox::with_inbox(vec![
            message("1", "Boss <boss@company.com>", "URGENT: numbers", 1, false),
            message("2", "News <digest@newsletter.com>", "Weekly digest", 1, false),
            message("3", "friend@example.com", "Old photos", 45, true),
            message("4", "billing@vendor.io", "Invoice 42", 2, false),
            message("5", "friend@example.com", "Lunch?", 0, false),
        ]),
        None,
        ProcessedLedger::in_memory(),
    );
    let stop = AtomicBool::new(false);

    let report = h
        .pipeline
        .run_once(h.mailbox.as_ref(), None, &stop)
        .await
        .unwrap();

    assert_eq!(report.recorded(), 5);
    assert_eq!(report.failures().count(), 0);

    let boss = report.outcome("1").unwrap();
    assert_eq!(boss.classification.label_names(), vec!["Important", "Work"]);
    assert!(boss.notified);
    assert!(!boss.deleted);

    assert!(report.outcome("2").unwrap().deleted);
    assert!(report.outcome("3").unwrap().deleted);
    assert_eq!(
        report.outcome("4").unwrap().classification.label_names(),
        vec!["Finance"]
    );
    assert!(!report.outcome("5").unwrap().labeled);

    let sent = h.outbox.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_id, "1");
    assert!(sent[0].subject.contains("Important"));

    let mut deleted = h.mailbox.deleted.lock().unwrap().clone();
    deleted.sort();
    assert_eq!(deleted, vec!["2".to_string(), "3".to_string()]);
}

#[tokio::test]
async fn second_cycle_has_no_side_effects() {
    let cfg = config();
    let h = harness(
        &cfg,
        FakeMailbox::with_inbox(vec![
            message("1", "boss@company.com", "urgent", 1, false),
            message("4", "billing@vendor.io", "Invoice 42", 2, false),
        ]),
        None,
        ProcessedLedger::in_memory(),
    );
    let stop = AtomicBool::new(false);

    h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    let again = h
        .pipeline
        .run_once(h.mailbox.as_ref(), Some(Utc::now()), &stop)
        .await
        .unwrap();

    assert_eq!(again.recorded(), 0);
    assert!(again.outcomes.is_empty());
    assert_eq!(h.mailbox.marked.lock().unwrap().len(), 2);
    assert_eq!(h.mailbox.labels.lock().unwrap().len(), 2);
    assert_eq!(h.outbox.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_label_retries_reported_once() {
    let cfg = config();
    let mailbox =
        FakeMailbox::with_inbox(vec![message("1", "boss@company.com", "urgent", 1, false)]);
    mailbox.fail_labels(10);
    let h = harness(&cfg, mailbox, None, ProcessedLedger::in_memory());
    let stop = AtomicBool::new(false);

    let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].action, ActionKind::LabelApply);
    assert_eq!(failures[0].attempts, 2);
    assert_eq!(report.outcome("1").unwrap().state, MessageState::Recorded);
    // The notification still went out.
    assert_eq!(h.outbox.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn transient_label_failure_recovers_within_pass() {
    let cfg = config();
    let mailbox =
        FakeMailbox::with_inbox(vec![message("1", "boss@company.com", "urgent", 1, false)]);
    mailbox.fail_labels(1);
    let h = harness(&cfg, mailbox, None, ProcessedLedger::in_memory());
    let stop = AtomicBool::new(false);

    let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    assert_eq!(report.failures().count(), 0);
    assert!(report.outcome("1").unwrap().labeled);
}

#[tokio::test]
async fn notification_outage_is_permanent_failure() {
    let cfg = config();
    let h = harness(
        &cfg,
        FakeMailbox::with_inbox(vec![message("1", "boss@company.com", "urgent", 1, false)]),
        None,
        ProcessedLedger::in_memory(),
    );
    h.outbox.down.store(true, Ordering::SeqCst);
    let stop = AtomicBool::new(false);

    let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    let outcome = report.outcome("1").unwrap();
    assert_eq!(outcome.state, MessageState::Recorded);
    assert!(outcome.labeled);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].action, ActionKind::Notify);
    assert!(outcome.failures[0].permanent);
}

#[tokio::test]
async fn llm_consulted_only_for_unmatched_messages() {
    let cfg = config();
    let llm = Arc::new(ScriptedLlm::new(Ok(LlmVerdict::Labels(vec![
        "Finance".into(),
        "Nonexistent".into(),
    ]))));
    let h = harness(
        &cfg,
        FakeMailbox::with_inbox(vec![
            message("1", "boss@company.com", "hello", 1, false),
            message("2", "someone@else.org", "Quarterly statement", 1, false),
        ]),
        Some(llm.clone()),
        ProcessedLedger::in_memory(),
    );
    let stop = AtomicBool::new(false);

    let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    let suggested = report.outcome("2").unwrap();
    assert_eq!(suggested.classification.label_names(), vec!["Finance"]);
    assert_eq!(
        suggested.classification.source_of("Finance"),
        Some(LabelSource::Llm)
    );
    // Finance does not notify.
    assert!(!suggested.notified);
}

#[tokio::test]
async fn unclassifiable_verdict_leaves_message_unlabelled() {
    let cfg = config();
    let llm = Arc::new(ScriptedLlm::new(Ok(LlmVerdict::Unclassifiable)));
    let h = harness(
        &cfg,
        FakeMailbox::with_inbox(vec![message("9", "someone@else.org", "hmm", 1, false)]),
        Some(llm),
        ProcessedLedger::in_memory(),
    );
    let stop = AtomicBool::new(false);

    let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    let outcome = report.outcome("9").unwrap();
    assert_eq!(outcome.state, MessageState::Recorded);
    assert!(outcome.classification.is_empty());
    assert!(outcome.llm_warning.is_none());
    assert!(h.mailbox.labels.lock().unwrap().is_empty());
}

#[tokio::test]
async fn llm_outage_defers_message_until_recovery() {
    let cfg = config();
    let llm = Arc::new(ScriptedLlm::recovering_after(
        1,
        Ok(LlmVerdict::Labels(vec!["Finance".into()])),
    ));
    let h = harness(
        &cfg,
        FakeMailbox::with_inbox(vec![message("9", "someone@else.org", "Statement", 1, false)]),
        Some(llm.clone()),
        ProcessedLedger::in_memory(),
    );
    let stop = AtomicBool::new(false);

    let first = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    let deferred = first.outcome("9").unwrap();
    assert_eq!(deferred.state, MessageState::Failed);
    assert!(deferred.llm_warning.is_some());
    assert_eq!(deferred.failures[0].action, ActionKind::Classify);
    assert!(!deferred.failures[0].permanent);
    assert!(!h.pipeline.ledger().contains("9"));
    assert!(h.mailbox.marked.lock().unwrap().is_empty());

    let second = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    let settled = second.outcome("9").unwrap();
    assert_eq!(settled.state, MessageState::Recorded);
    assert!(settled.failures.is_empty());
    assert_eq!(settled.classification.label_names(), vec!["Finance"]);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.mailbox.labels.lock().unwrap().as_slice(),
        [("9".to_string(), vec!["Finance".to_string()])]
    );
}

#[tokio::test]
async fn llm_outage_settles_after_configured_cycles() {
    let cfg = config();
    assert_eq!(cfg.processing.pipeline_config().llm_retry_cycles, 3);
    let llm = Arc::new(ScriptedLlm::new(Err("503".into())));
    let h = harness(
        &cfg,
        FakeMailbox::with_inbox(vec![message("9", "someone@else.org", "hmm", 1, false)]),
        Some(llm.clone()),
        ProcessedLedger::in_memory(),
    );
    let stop = AtomicBool::new(false);

    for _ in 0..2 {
        let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
        assert_eq!(report.outcome("9").unwrap().state, MessageState::Failed);
    }

    let last = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    let outcome = last.outcome("9").unwrap();
    assert_eq!(outcome.state, MessageState::Recorded);
    assert!(outcome.classification.is_empty());
    assert_eq!(outcome.failures[0].action, ActionKind::Classify);
    assert_eq!(outcome.failures[0].attempts, 3);
    assert!(outcome.failures[0].permanent);

    let after = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    assert!(after.outcomes.is_empty());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn marker_prevents_reprocessing_with_fresh_ledger() {
    let cfg = config();
    let mailbox = Arc::new(FakeMailbox::with_inbox(vec![
        message("1", "boss@company.com", "urgent", 1, false),
        message("4", "billing@vendor.io", "Invoice 42", 2, false),
    ]));
    let stop = AtomicBool::new(false);

    let first = harness_on(&cfg, mailbox.clone(), None, ProcessedLedger::in_memory());
    let report = first.pipeline.run_once(mailbox.as_ref(), None, &stop).await.unwrap();
    assert_eq!(report.recorded(), 2);

    let restarted = harness_on(&cfg, mailbox.clone(), None, ProcessedLedger::in_memory());
    let report = restarted
        .pipeline
        .run_once(mailbox.as_ref(), None, &stop)
        .await
        .unwrap();
    assert!(report.outcomes.is_empty());
    assert!(restarted.outbox.sent.lock().unwrap().is_empty());
    assert_eq!(mailbox.labels.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn body_and_display_name_rules_label_messages() {
    let cfg = config();
    let trip = Message::new(
        "t",
        "noreply@airline.example",
        "Your trip",
        "Attached is your boarding pass for Friday",
        Utc::now(),
        false,
    );
    let h = harness(
        &cfg,
        FakeMailbox::with_inbox(vec![
            trip,
            message("p", "Payroll Team <hr@people.example>", "March payslip", 1, false),
        ]),
        None,
        ProcessedLedger::in_memory(),
    );
    let stop = AtomicBool::new(false);

    let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    assert_eq!(
        report.outcome("t").unwrap().classification.label_names(),
        vec!["Travel"]
    );
    assert_eq!(
        report.outcome("p").unwrap().classification.label_names(),
        vec!["Payroll"]
    );
}

#[tokio::test]
async fn persisted_ledger_prevents_reprocessing_after_restart() {
    let cfg = config();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let inbox = || vec![message("1", "boss@company.com", "urgent", 1, false)];
    let stop = AtomicBool::new(false);

    {
        let store: Arc<dyn LedgerStore> =
            Arc::new(LibSqlLedgerStore::new_local(&path).await.unwrap());
        let ledger = ProcessedLedger::with_store(store).await.unwrap();
        let h = harness(&cfg, FakeMailbox::with_inbox(inbox()), None, ledger);
        let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
        assert_eq!(report.recorded(), 1);
    }

    let store: Arc<dyn LedgerStore> = Arc::new(LibSqlLedgerStore::new_local(&path).await.unwrap());
    let ledger = ProcessedLedger::with_store(store).await.unwrap();
    let h = harness(&cfg, FakeMailbox::with_inbox(inbox()), None, ledger);
    let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();

    assert_eq!(report.recorded(), 0);
    assert_eq!(report.duplicates, vec!["1".to_string()]);
    assert!(h.outbox.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn boss_mail_always_labelled_and_notified() {
    let cfg = config();
    let subjects = ["Urgent", "re: lunch", "", "Quarterly plan", "URGENT!!"];
    let inbox: Vec<Message> = subjects
        .iter()
        .enumerate()
        .map(|(i, s)| message(&format!("b{i}"), "BOSS@Company.com", s, 0, false))
        .collect();
    let h = harness(&cfg, FakeMailbox::with_inbox(inbox), None, ProcessedLedger::in_memory());
    let stop = AtomicBool::new(false);

    let report = h.pipeline.run_once(h.mailbox.as_ref(), None, &stop).await.unwrap();
    assert_eq!(report.recorded(), subjects.len());
    for outcome in &report.outcomes {
        assert!(outcome.classification.contains("Important"), "{}", outcome.message_id);
        assert!(outcome.notified, "{}", outcome.message_id);
    }
    assert_eq!(h.outbox.sent.lock().unwrap().len(), subjects.len());
}
