//! Message processing pipeline.
//!
//! Every fetched message flows through:
//! 1. `LabelClassifier::classify()`: criteria rules, LLM fallback when nothing matched
//! 2. `CleaningPolicy::evaluate()`: delete or keep
//! 3. Label apply, delete and `NotificationRouter` dispatch, each retried on its own
//! 4. `ProcessedLedger::record()`: the id is never processed again
//!
//! `poller` drives this on a timer.

pub mod classifier;
pub mod cleaning;
pub mod ledger;
pub mod poller;
pub mod processor;
pub mod rules;
pub mod types;

pub use classifier::LabelClassifier;
pub use cleaning::{CleaningPolicy, CleaningRule};
pub use ledger::{LedgerStore, ProcessedLedger};
pub use processor::{CycleReport, PipelineConfig, ProcessingPipeline};
pub use rules::LabelRule;
pub use types::{ClassificationResult, Message, MessageFetcher};
