//! Ledger / Storage Collaborator
//!
//! Balances and game history live outside this process. The server only
//! needs three operations: read a balance, apply a delta, and persist a
//! session record.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::ids::{PlayerId, RoundId};

/// Game type recorded on every session row.
pub const GAME_TYPE: &str = "crash";

/// Errors from the ledger collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Transient failure; the call may be retried.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The ledger has no account for this player.
    #[error("unknown player {0}")]
    UnknownPlayer(String),

    /// A debit would take the balance below zero.
    #[error("insufficient funds: balance {balance}, delta {delta}")]
    InsufficientFunds {
        /// Balance before the debit.
        balance: i64,
        /// Requested delta.
        delta: i64,
    },

    /// Any other permanent refusal.
    #[error("ledger rejected request: {0}")]
    Rejected(String),
}

impl LedgerError {
    /// Whether retrying the same call can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One persisted game session, shaped like a `game_sessions` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    /// Player the session belongs to (UUID string).
    pub user_id: String,
    /// Always [`GAME_TYPE`].
    pub game_type: String,
    /// Coins staked.
    pub bet_amount: u64,
    /// Cashout multiplier, `0` for a loss.
    pub multiplier: f64,
    /// Net result: profit on a cashout, `-stake` on a loss.
    pub outcome_amount: i64,
    /// `{cashed_out_at, round_id}` or `{crashed_at, round_id}`.
    pub game_data: serde_json::Value,
    /// When the outcome was settled.
    pub created_at: DateTime<Utc>,
}

/// External ledger used for affordability checks and settlement.
pub trait LedgerStore: Clone + Send + Sync + 'static {
    /// Current balance of a player.
    fn get_balance(
        &self,
        player: PlayerId,
    ) -> impl Future<Output = Result<i64, LedgerError>> + Send;

    /// Apply a signed delta. Returns the new balance.
    fn adjust_balance(
        &self,
        player: PlayerId,
        delta: i64,
    ) -> impl Future<Output = Result<i64, LedgerError>> + Send;

    /// Persist a session record.
    fn record_session(
        &self,
        record: SettlementRecord,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;
}

// =============================================================================
// IN-MEMORY LEDGER
// =============================================================================

#[derive(Default)]
struct LedgerState {
    balances: HashMap<PlayerId, i64>,
    sessions: Vec<SettlementRecord>,
    fail_balance_calls: u32,
    fail_record_calls: u32,
    adjust_calls: u64,
}

/// In-process ledger for development and tests.
///
/// With a starting balance, unknown players are provisioned on first use.
#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    starting_balance: Option<i64>,
}

impl InMemoryLedger {
    /// Create a ledger. `starting_balance` auto-provisions new players.
    pub fn new(starting_balance: Option<i64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            starting_balance,
        }
    }

    /// Set a player's balance directly.
    pub async fn set_balance(&self, player: PlayerId, balance: i64) {
        self.state.lock().await.balances.insert(player, balance);
    }

    /// Copy of every recorded session.
    pub async fn sessions(&self) -> Vec<SettlementRecord> {
        self.state.lock().await.sessions.clone()
    }

    /// Number of `adjust_balance` calls that changed a balance.
    pub async fn adjust_calls(&self) -> u64 {
        self.state.lock().await.adjust_calls
    }

    /// Make the next `n` balance calls fail with [`LedgerError::Unavailable`].
    pub async fn fail_next_balance_calls(&self, n: u32) {
        self.state.lock().await.fail_balance_calls = n;
    }

    /// Make the next `n` record calls fail with [`LedgerError::Unavailable`].
    pub async fn fail_next_record_calls(&self, n: u32) {
        self.state.lock().await.fail_record_calls = n;
    }

    fn lookup(&self, state: &mut LedgerState, player: PlayerId) -> Result<i64, LedgerError> {
        if let Some(balance) = state.balances.get(&player) {
            return Ok(*balance);
        }
        match self.starting_balance {
            Some(initial) => {
                state.balances.insert(player, initial);
                Ok(initial)
            }
            None => Err(LedgerError::UnknownPlayer(player.to_uuid_string())),
        }
    }
}

impl LedgerStore for InMemoryLedger {
    async fn get_balance(&self, player: PlayerId) -> Result<i64, LedgerError> {
        let mut state = self.state.lock().await;
        if state.fail_balance_calls > 0 {
            state.fail_balance_calls -= 1;
            return Err(LedgerError::Unavailable("injected failure".into()));
        }
        self.lookup(&mut state, player)
    }

    async fn adjust_balance(&self, player: PlayerId, delta: i64) -> Result<i64, LedgerError> {
        let mut state = self.state.lock().await;
        if state.fail_balance_calls > 0 {
            state.fail_balance_calls -= 1;
            return Err(LedgerError::Unavailable("injected failure".into()));
        }

        let balance = self.lookup(&mut state, player)?;
        let updated = balance
            .checked_add(delta)
            .ok_or_else(|| LedgerError::Rejected("balance overflow".into()))?;
        if updated < 0 {
            return Err(LedgerError::InsufficientFunds { balance, delta });
        }

        state.balances.insert(player, updated);
        state.adjust_calls += 1;
        Ok(updated)
    }

    async fn record_session(&self, record: SettlementRecord) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if state.fail_record_calls > 0 {
            state.fail_record_calls -= 1;
            return Err(LedgerError::Unavailable("injected failure".into()));
        }
        state.sessions.push(record);
        Ok(())
    }
}

/// Session metadata for a round outcome.
pub fn session_game_data(key: &str, multiplier: f64, round_id: &RoundId) -> serde_json::Value {
    let mut data = serde_json::Map::new();
    data.insert(key.to_string(), serde_json::json!(multiplier));
    data.insert("round_id".to_string(), serde_json::json!(round_id.to_uuid_string()));
    serde_json::Value::Object(data)
}
