//! Background poll loop: fetches new mail on a timer and runs each batch
//! through the `ProcessingPipeline`.
//!
//! The first cycle fetches everything the mailbox returns. Later cycles fetch
//! from one day before the previous cycle started, which overlaps on purpose;
//! the ledger drops what was already handled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::pipeline::processor::ProcessingPipeline;
use crate::pipeline::types::MessageFetcher;

/// Default poll interval: 5 minutes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Overlap between consecutive fetch windows.
const FETCH_OVERLAP_DAYS: i64 = 1;

/// Handle to a running poll loop.
pub struct PollerHandle {
    pub handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PollerHandle {
    /// Ask the loop to stop. The current cycle finishes its in-flight messages.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Poll loop task failed");
        }
    }
}

/// Lower bound for the next fetch, given when the last successful cycle began.
pub fn next_since(last_cycle_start: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    last_cycle_start.map(|start| start - chrono::Duration::days(FETCH_OVERLAP_DAYS))
}

/// Spawn the poll loop. The first cycle runs immediately.
pub fn spawn_poll_loop(
    pipeline: Arc<ProcessingPipeline>,
    fetcher: Arc<dyn MessageFetcher>,
    interval: Duration,
) -> PollerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let shutdown_flag = Arc::clone(&shutdown);
    let wake_signal = Arc::clone(&wake);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Poll loop started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_start: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wake.notified() => {}
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Poll loop shutting down");
                return;
            }

            let started = Utc::now();
            let since = next_since(last_start);
            match pipeline.run_once(fetcher.as_ref(), since, &shutdown).await {
                Ok(report) => {
                    for failure in report.failures() {
                        warn!(
                            run_id = %report.run_id,
                            id = %failure.message_id,
                            action = failure.action.label(),
                            attempts = failure.attempts,
                            reason = %failure.reason,
                            "Action failure"
                        );
                    }
                    last_start = Some(started);
                }
                Err(e) => {
                    // Window stays put so the next cycle covers this one.
                    error!(error = %e, "Poll cycle failed");
                }
            }
        }
    });

    PollerHandle {
        handle,
        shutdown: shutdown_flag,
        wake: wake_signal,
    }
}
