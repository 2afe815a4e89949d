use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_agent::config::{AppConfig, LoggingConfig};
use mail_agent::llm::create_classifier;
use mail_agent::mailbox::ImapMailbox;
use mail_agent::notify::{NotificationRouter, create_sender};
use mail_agent::pipeline::poller::spawn_poll_loop;
use mail_agent::pipeline::{
    CleaningPolicy, LabelClassifier, LedgerStore, ProcessedLedger, ProcessingPipeline,
};
use mail_agent::store::LibSqlLedgerStore;

const LOG_FILE_NAME: &str = "mail_agent.log";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // A missing .env is fine; variables may come from the real environment.
    let _ = dotenvy::dotenv();

    let config_path = AppConfig::default_path();
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let _log_guard = init_tracing(&config.logging);

    eprintln!("📬 Mail Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config_path.display());
    eprintln!(
        "   Mailbox: {} ({}, {})",
        config.mailbox.username,
        config.mailbox.server,
        config.mailbox.provider.name()
    );
    eprintln!("   Labels: {}", config.labels.len());
    eprintln!("   Poll: every {}s", config.poll_interval.as_secs());

    // ── Classifier ──────────────────────────────────────────────────
    let mut classifier = LabelClassifier::new(config.labels.clone());
    match &config.llm {
        Some(llm_config) => {
            let llm = create_classifier(llm_config).context("Failed to create LLM classifier")?;
            eprintln!("   LLM fallback: {} ({})", llm.name(), llm_config.model);
            classifier = classifier.with_llm(llm, config.processing.llm_timeout());
        }
        None => eprintln!("   LLM fallback: disabled"),
    }

    // ── Ledger ──────────────────────────────────────────────────────
    let ledger = match &config.ledger.path {
        Some(path) => {
            let store: Arc<dyn LedgerStore> = Arc::new(
                LibSqlLedgerStore::new_local(path)
                    .await
                    .with_context(|| format!("Failed to open ledger at {}", path.display()))?,
            );
            let ledger = ProcessedLedger::with_store(store).await?;
            eprintln!("   Ledger: {} ({} recorded)", path.display(), ledger.len());
            ledger
        }
        None => {
            eprintln!("   Ledger: in-memory");
            ProcessedLedger::in_memory()
        }
    };

    // ── Pipeline ────────────────────────────────────────────────────
    let mailbox = Arc::new(ImapMailbox::new(config.mailbox.clone()));
    let retry = config.processing.retry_policy();

    let mut pipeline = ProcessingPipeline::new(
        classifier,
        CleaningPolicy::new(config.cleaning.clone()),
        mailbox.clone(),
        mailbox.clone(),
        Arc::new(ledger),
    )
    .with_marker(mailbox.clone())
    .with_config(config.processing.pipeline_config());

    match &config.notifications {
        Some(channel) => {
            let sender = create_sender(channel, reqwest::Client::new());
            eprintln!("   Notifications: {}", channel.kind());
            pipeline = pipeline.with_router(
                NotificationRouter::new(channel.clone(), sender)
                    .with_timeout(config.processing.send_timeout())
                    .with_retry(retry),
            );
        }
        None => eprintln!("   Notifications: disabled"),
    }
    eprintln!();

    let poller = spawn_poll_loop(Arc::new(pipeline), mailbox, config.poll_interval);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    poller.shutdown().await;
    tracing::info!("Mail agent stopped");

    Ok(())
}

/// Console logging always; a daily-rotated file when a directory is configured.
fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}
