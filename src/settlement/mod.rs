//! Settlement Layer
//!
//! Converts terminal bet outcomes into balance adjustments and history rows
//! through the external ledger. Runs on its own worker; the round driver
//! only enqueues jobs.

pub mod store;
pub mod connector;

pub use store::{InMemoryLedger, LedgerError, LedgerStore, SettlementRecord};
pub use connector::{
    BetOutcome, DEFAULT_SETTLED_CAPACITY, RetryPolicy, SettlementConnector, SettlementError, SettlementJob,
    SettlementSender, spawn_settlement_worker,
};
