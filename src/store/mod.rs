//! Persistence layer: libSQL-backed storage for the processed ledger.

pub mod ledger;
pub mod migrations;

pub use ledger::LibSqlLedgerStore;
