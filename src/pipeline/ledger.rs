//! Processed-message ledger.
//!
//! Guarantees at-most-once side effects per message id. A message is claimed
//! before its actions run and recorded only after all of them were attempted.
//! Recorded ids are never removed; a failed pass releases its claim so the
//! next cycle can retry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::error::DatabaseError;

/// Optional persistence for the ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load every recorded message id.
    async fn load(&self) -> Result<HashSet<String>, DatabaseError>;

    /// Persist one recorded id with a short outcome summary. Idempotent.
    async fn record(&self, message_id: &str, outcome: &str) -> Result<(), DatabaseError>;
}

/// Result of trying to claim a message for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Caller now owns the message until `record` or `release`.
    Claimed,
    /// Already fully processed.
    AlreadyProcessed,
    /// Another pass is processing it right now.
    InFlight,
}

#[derive(Debug, Default)]
struct LedgerState {
    processed: HashSet<String>,
    in_flight: HashSet<String>,
}

/// Set of processed message ids plus in-flight claims.
pub struct ProcessedLedger {
    state: Mutex<LedgerState>,
    store: Option<Arc<dyn LedgerStore>>,
}

impl ProcessedLedger {
    /// In-memory ledger for one run.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            store: None,
        }
    }

    /// Ledger seeded from (and writing through to) a persistent store.
    pub async fn with_store(store: Arc<dyn LedgerStore>) -> Result<Self, DatabaseError> {
        let processed = store.load().await?;
        debug!(count = processed.len(), "Loaded processed ledger");
        Ok(Self {
            state: Mutex::new(LedgerState {
                processed,
                in_flight: HashSet::new(),
            }),
            store: Some(store),
        })
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically check and claim `message_id`.
    pub fn try_claim(&self, message_id: &str) -> Claim {
        let mut state = self.state();
        if state.processed.contains(message_id) {
            return Claim::AlreadyProcessed;
        }
        if !state.in_flight.insert(message_id.to_string()) {
            return Claim::InFlight;
        }
        Claim::Claimed
    }

    /// Mark a claimed message as processed.
    ///
    /// The store write happens first; on failure the claim is kept so the
    /// caller can release it.
    pub async fn record(&self, message_id: &str, outcome: &str) -> Result<(), DatabaseError> {
        if let Some(store) = &self.store {
            store.record(message_id, outcome).await?;
        }
        let mut state = self.state();
        state.in_flight.remove(message_id);
        state.processed.insert(message_id.to_string());
        Ok(())
    }

    /// Drop a claim without recording, so a later cycle retries the message.
    pub fn release(&self, message_id: &str) {
        self.state().in_flight.remove(message_id);
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.state().processed.contains(message_id)
    }

    /// Number of recorded ids.
    pub fn len(&self) -> usize {
        self.state().processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }
}
