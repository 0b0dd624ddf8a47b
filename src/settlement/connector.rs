//! Settlement Connector
//!
//! Turns a bet outcome into a balance adjustment plus a session record.
//!
//! Settlement is idempotent per (round, player): each finished step is
//! remembered, a repeated job returns the stored record, and a retry after a
//! failure resumes at the first unfinished step. Finished entries are kept
//! for the most recent settlements only.
//!
//! The worker never drops a job while the ledger is merely unavailable: it
//! settles again after a pause until the ledger answers. Only a permanent
//! refusal ends a job unsettled.
//!
//! ```text
//! job ──► claim ──► adjust_balance ──► record_session ──► done
//!          ▲         (skip if done)     (retry w/ backoff)
//!          └──────── retryable failure, after max_backoff
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::core::ids::{PlayerId, RoundId};
use crate::core::multiplier::Multiplier;
use crate::settlement::store::{
    GAME_TYPE, LedgerError, LedgerStore, SettlementRecord, session_game_data,
};

// =============================================================================
// JOBS
// =============================================================================

/// Terminal outcome of a bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetOutcome {
    /// Cashed out before the crash.
    CashedOut {
        /// Locked-in multiplier.
        multiplier: Multiplier,
    },
    /// Still riding when the round crashed.
    Lost {
        /// The round's crash point.
        crash_point: Multiplier,
    },
}

/// Work item queued by the round driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementJob {
    /// Round of the bet.
    pub round_id: RoundId,
    /// Owner of the bet.
    pub player_id: PlayerId,
    /// Coins staked.
    pub stake: u64,
    /// How the bet ended.
    pub outcome: BetOutcome,
}

impl SettlementJob {
    /// Job for a cashout.
    pub fn cashout(round_id: RoundId, player_id: PlayerId, stake: u64, multiplier: Multiplier) -> Self {
        Self { round_id, player_id, stake, outcome: BetOutcome::CashedOut { multiplier } }
    }

    /// Job for a loss.
    pub fn loss(round_id: RoundId, player_id: PlayerId, stake: u64, crash_point: Multiplier) -> Self {
        Self { round_id, player_id, stake, outcome: BetOutcome::Lost { crash_point } }
    }

    /// Idempotency key.
    pub fn key(&self) -> (RoundId, PlayerId) {
        (self.round_id, self.player_id)
    }

    /// Signed balance change: profit on a cashout, `-stake` on a loss.
    pub fn balance_delta(&self) -> i64 {
        match self.outcome {
            BetOutcome::CashedOut { multiplier } => multiplier.profit(self.stake),
            BetOutcome::Lost { .. } => -(self.stake.min(i64::MAX as u64) as i64),
        }
    }

    /// Session record for this outcome.
    pub fn to_record(&self) -> SettlementRecord {
        let (multiplier, game_data) = match self.outcome {
            BetOutcome::CashedOut { multiplier } => (
                multiplier.as_f64(),
                session_game_data("cashed_out_at", multiplier.as_f64(), &self.round_id),
            ),
            BetOutcome::Lost { crash_point } => (
                0.0,
                session_game_data("crashed_at", crash_point.as_f64(), &self.round_id),
            ),
        };

        SettlementRecord {
            user_id: self.player_id.to_uuid_string(),
            game_type: GAME_TYPE.to_string(),
            bet_amount: self.stake,
            multiplier,
            outcome_amount: self.balance_delta(),
            game_data,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// ERRORS / POLICY
// =============================================================================

/// Settlement failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    /// The ledger stayed unavailable for every attempt.
    #[error("ledger unavailable after {attempts} attempts: {source}")]
    Retryable {
        /// Attempts made.
        attempts: usize,
        /// Last error seen.
        source: LedgerError,
    },

    /// The ledger refused the operation permanently.
    #[error("ledger rejected settlement: {0}")]
    Rejected(LedgerError),

    /// Another task is settling the same bet.
    #[error("settlement already in flight")]
    AlreadyInFlight,
}

/// Retry policy for ledger calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call (including the first).
    pub max_attempts: usize,
    /// Delay after the first retryable failure.
    pub initial_backoff: Duration,
    /// Maximum delay between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// CONNECTOR
// =============================================================================

/// Finished settlements remembered for deduplication.
pub const DEFAULT_SETTLED_CAPACITY: usize = 10_000;

type BetKey = (RoundId, PlayerId);

#[derive(Default)]
struct Progress {
    record: Option<SettlementRecord>,
    balance_adjusted: bool,
    completed: bool,
    in_flight: bool,
}

/// Per-bet progress. Entries that stopped short on a retryable error stay
/// until they finish; finished ones are evicted oldest first.
struct ProgressTable {
    entries: HashMap<BetKey, Progress>,
    finished: VecDeque<BetKey>,
    capacity: usize,
}

impl ProgressTable {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            finished: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn finish(&mut self, key: BetKey) {
        if self.finished.contains(&key) {
            return;
        }
        self.finished.push_back(key);
        while self.finished.len() > self.capacity {
            if let Some(oldest) = self.finished.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Settles bet outcomes against a [`LedgerStore`].
#[derive(Clone)]
pub struct SettlementConnector<L: LedgerStore> {
    store: L,
    policy: RetryPolicy,
    progress: Arc<Mutex<ProgressTable>>,
}

impl<L: LedgerStore> SettlementConnector<L> {
    /// Create a connector remembering [`DEFAULT_SETTLED_CAPACITY`] finished bets.
    pub fn new(store: L, policy: RetryPolicy) -> Self {
        Self::with_settled_capacity(store, policy, DEFAULT_SETTLED_CAPACITY)
    }

    /// Create a connector remembering `capacity` finished bets.
    ///
    /// A job settled longer ago than that is no longer deduplicated here;
    /// the round driver emits each outcome once.
    pub fn with_settled_capacity(store: L, policy: RetryPolicy, capacity: usize) -> Self {
        Self {
            store,
            policy,
            progress: Arc::new(Mutex::new(ProgressTable::new(capacity))),
        }
    }

    /// The ledger this connector writes to.
    pub fn store(&self) -> &L {
        &self.store
    }

    /// Retry policy for ledger calls.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Settle one bet. Safe to call again with the same job.
    pub async fn settle(&self, job: &SettlementJob) -> Result<SettlementRecord, SettlementError> {
        let key = job.key();

        let (record, balance_adjusted) = {
            let mut progress = self.progress.lock().await;
            let entry = progress.entries.entry(key).or_default();
            if entry.completed {
                if let Some(record) = &entry.record {
                    return Ok(record.clone());
                }
            }
            if entry.in_flight {
                return Err(SettlementError::AlreadyInFlight);
            }
            entry.in_flight = true;
            // The record, timestamp included, is fixed by the first attempt.
            let record = entry.record.get_or_insert_with(|| job.to_record()).clone();
            (record, entry.balance_adjusted)
        };

        let result = self.run(job, record, balance_adjusted).await;

        let mut progress = self.progress.lock().await;
        if let Some(entry) = progress.entries.get_mut(&key) {
            entry.in_flight = false;
            entry.completed = result.is_ok();
        }
        if !matches!(result, Err(SettlementError::Retryable { .. })) {
            progress.finish(key);
        }
        result
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.progress.lock().await.entries.len()
    }

    async fn run(
        &self,
        job: &SettlementJob,
        record: SettlementRecord,
        balance_adjusted: bool,
    ) -> Result<SettlementRecord, SettlementError> {
        if !balance_adjusted {
            let delta = job.balance_delta();
            self.with_retry("adjust_balance", || self.store.adjust_balance(job.player_id, delta))
                .await?;

            let mut progress = self.progress.lock().await;
            if let Some(entry) = progress.entries.get_mut(&job.key()) {
                entry.balance_adjusted = true;
            }
        }

        self.with_retry("record_session", || self.store.record_session(record.clone()))
            .await?;
        Ok(record)
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, SettlementError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0usize;
        let mut backoff = self.policy.initial_backoff;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(SettlementError::Rejected(err)),
                Err(err) if attempt >= max_attempts => {
                    return Err(SettlementError::Retryable { attempts: attempt, source: err });
                }
                Err(err) => {
                    warn!(op, attempt, error = %err, "Ledger call failed, retrying");
                }
            }

            if backoff > Duration::ZERO {
                sleep(backoff).await;
                backoff = std::cmp::min(backoff.saturating_mul(2), self.policy.max_backoff);
            }
        }
    }
}

/// Sender half of the settlement queue.
pub type SettlementSender = mpsc::UnboundedSender<SettlementJob>;

/// Drain the settlement queue, settling each job on its own task so a slow
/// ledger never holds up the next job.
///
/// Once the queue closes the worker waits for every job still in flight,
/// so awaiting the returned handle drains outstanding settlements.
pub fn spawn_settlement_worker<L: LedgerStore>(
    connector: SettlementConnector<L>,
    mut jobs: mpsc::UnboundedReceiver<SettlementJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => {
                        in_flight.spawn(settle_until_done(connector.clone(), job));
                    }
                    None => break,
                },
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join_error(result);
                }
            }
        }

        if !in_flight.is_empty() {
            info!(pending = in_flight.len(), "Settlement queue closed, draining");
        }
        while let Some(result) = in_flight.join_next().await {
            log_join_error(result);
        }
        info!("Settlement worker stopped");
    })
}

/// Settle a job, pausing `max_backoff` between attempts while the ledger is
/// unavailable.
async fn settle_until_done<L: LedgerStore>(connector: SettlementConnector<L>, job: SettlementJob) {
    let pause = connector.policy().max_backoff;
    let mut deferrals = 0u32;

    loop {
        match connector.settle(&job).await {
            Ok(record) => {
                info!(
                    round = %job.round_id.short(),
                    player = %job.player_id.short(),
                    outcome = record.outcome_amount,
                    "Bet settled"
                );
                return;
            }
            Err(SettlementError::AlreadyInFlight) => return,
            Err(e @ SettlementError::Retryable { .. }) => {
                deferrals += 1;
                warn!(
                    round = %job.round_id.short(),
                    player = %job.player_id.short(),
                    deferrals,
                    error = %e,
                    "Settlement deferred"
                );
                sleep(pause).await;
            }
            Err(e) => {
                error!(
                    round = %job.round_id.short(),
                    player = %job.player_id.short(),
                    error = %e,
                    "Settlement failed"
                );
                return;
            }
        }
    }
}

fn log_join_error(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Settlement task aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::store::InMemoryLedger;

    fn quick_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn test_cashout_settlement() {
        let ledger = InMemoryLedger::new(Some(1_000));
        let connector = SettlementConnector::new(ledger.clone(), quick_policy(1));
        let player = PlayerId::new([1; 16]);
        let job = SettlementJob::cashout(RoundId::new([9; 16]), player, 100, Multiplier::from_hundredths(200));

        let record = connector.settle(&job).await.unwrap();
        assert_eq!(record.outcome_amount, 100);
        assert_eq!(record.multiplier, 2.0);
        assert_eq!(record.game_type, "crash");
        assert_eq!(record.game_data["cashed_out_at"], serde_json::json!(2.0));
        assert_eq!(ledger.get_balance(player).await, Ok(1_100));
        assert_eq!(ledger.sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_loss_settlement() {
        let ledger = InMemoryLedger::new(Some(1_000));
        let connector = SettlementConnector::new(ledger.clone(), quick_policy(1));
        let player = PlayerId::new([2; 16]);
        let job = SettlementJob::loss(RoundId::new([9; 16]), player, 50, Multiplier::from_hundredths(173));

        let record = connector.settle(&job).await.unwrap();
        assert_eq!(record.outcome_amount, -50);
        assert_eq!(record.multiplier, 0.0);
        assert_eq!(record.game_data["crashed_at"], serde_json::json!(1.73));
        assert_eq!(ledger.get_balance(player).await, Ok(950));
    }

    #[tokio::test]
    async fn test_settle_twice_adjusts_once() {
        let ledger = InMemoryLedger::new(Some(1_000));
        let connector = SettlementConnector::new(ledger.clone(), quick_policy(1));
        let player = PlayerId::new([3; 16]);
        let job = SettlementJob::cashout(RoundId::new([9; 16]), player, 100, Multiplier::from_hundredths(150));

        let first = connector.settle(&job).await.unwrap();
        let second = connector.settle(&job).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.adjust_calls().await, 1);
        assert_eq!(ledger.get_balance(player).await, Ok(1_050));
        assert_eq!(ledger.sessions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let ledger = InMemoryLedger::new(Some(1_000));
        ledger.fail_next_balance_calls(2).await;
        let connector = SettlementConnector::new(ledger.clone(), quick_policy(3));
        let player = PlayerId::new([4; 16]);
        let job = SettlementJob::loss(RoundId::new([9; 16]), player, 10, Multiplier::ONE);

        assert!(connector.settle(&job).await.is_ok());
        assert_eq!(ledger.get_balance(player).await, Ok(990));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_then_resume() {
        let ledger = InMemoryLedger::new(Some(1_000));
        let connector = SettlementConnector::new(ledger.clone(), quick_policy(2));
        let player = PlayerId::new([5; 16]);
        let job = SettlementJob::cashout(RoundId::new([9; 16]), player, 100, Multiplier::from_hundredths(300));

        ledger.fail_next_record_calls(2).await;
        let err = connector.settle(&job).await.unwrap_err();
        assert!(matches!(err, SettlementError::Retryable { attempts: 2, .. }));
        // Balance step finished before the record step failed.
        assert_eq!(ledger.get_balance(player).await, Ok(1_200));

        let record = connector.settle(&job).await.unwrap();
        assert_eq!(record.outcome_amount, 200);
        assert_eq!(ledger.adjust_calls().await, 1);
        assert_eq!(ledger.get_balance(player).await, Ok(1_200));
        assert_eq!(ledger.sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let ledger = InMemoryLedger::new(None);
        let connector = SettlementConnector::new(ledger.clone(), quick_policy(5));
        let job = SettlementJob::loss(RoundId::new([9; 16]), PlayerId::new([6; 16]), 10, Multiplier::ONE);

        let err = connector.settle(&job).await.unwrap_err();
        assert!(matches!(err, SettlementError::Rejected(LedgerError::UnknownPlayer(_))));
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let ledger = InMemoryLedger::new(Some(100));
        let connector = SettlementConnector::new(ledger.clone(), quick_policy(1));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = spawn_settlement_worker(connector, rx);

        for n in 0..3u8 {
            tx.send(SettlementJob::loss(RoundId::new([1; 16]), PlayerId::new([n; 16]), 10, Multiplier::ONE))
                .unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        assert_eq!(ledger.sessions().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_waits_for_retrying_job() {
        let ledger = InMemoryLedger::new(Some(100));
        ledger.fail_next_balance_calls(2).await;
        // Each settle call gives up after one attempt, so the worker defers twice.
        let connector = SettlementConnector::new(ledger.clone(), quick_policy(1));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = spawn_settlement_worker(connector, rx);

        tx.send(SettlementJob::loss(RoundId::new([1; 16]), PlayerId::new([1; 16]), 10, Multiplier::ONE))
            .unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(ledger.sessions().await.len(), 1);
        assert_eq!(ledger.get_balance(PlayerId::new([1; 16])).await, Ok(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_outlasts_ledger_outage() {
        let ledger = InMemoryLedger::new(Some(1_000));
        // More failures than one settle call retries through.
        ledger.fail_next_balance_calls(6).await;
        let connector = SettlementConnector::new(ledger.clone(), RetryPolicy::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = spawn_settlement_worker(connector, rx);
        let player = PlayerId::new([4; 16]);

        tx.send(SettlementJob::cashout(RoundId::new([2; 16]), player, 100, Multiplier::from_hundredths(300)))
            .unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(ledger.get_balance(player).await, Ok(1_200));
        assert_eq!(ledger.adjust_calls().await, 1);
        assert_eq!(ledger.sessions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_outage_spanning_several_deferrals() {
        let ledger = InMemoryLedger::new(Some(1_000));
        ledger.fail_next_record_calls(7).await;
        let connector = SettlementConnector::new(ledger.clone(), quick_policy(2));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = spawn_settlement_worker(connector, rx);
        let player = PlayerId::new([5; 16]);

        tx.send(SettlementJob::cashout(RoundId::new([2; 16]), player, 100, Multiplier::from_hundredths(300)))
            .unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(ledger.get_balance(player).await, Ok(1_200));
        assert_eq!(ledger.adjust_calls().await, 1);
        assert_eq!(ledger.sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_finished_entries_are_bounded() {
        let ledger = InMemoryLedger::new(Some(10_000));
        let connector = SettlementConnector::with_settled_capacity(ledger.clone(), quick_policy(1), 8);

        for n in 0..100u8 {
            let job = SettlementJob::loss(RoundId::new([n; 16]), PlayerId::new([1; 16]), 1, Multiplier::ONE);
            connector.settle(&job).await.unwrap();
        }
        assert_eq!(connector.tracked().await, 8);

        // The most recent settlement is still deduplicated.
        let recent = SettlementJob::loss(RoundId::new([99; 16]), PlayerId::new([1; 16]), 1, Multiplier::ONE);
        connector.settle(&recent).await.unwrap();
        assert_eq!(ledger.adjust_calls().await, 100);
        assert_eq!(ledger.sessions().await.len(), 100);
        assert_eq!(connector.tracked().await, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfinished_entry_survives_eviction() {
        let ledger = InMemoryLedger::new(Some(10_000));
        let connector = SettlementConnector::with_settled_capacity(ledger.clone(), quick_policy(1), 2);
        let player = PlayerId::new([3; 16]);
        let pending = SettlementJob::cashout(RoundId::new([200; 16]), player, 100, Multiplier::from_hundredths(300));

        ledger.fail_next_record_calls(1).await;
        assert!(connector.settle(&pending).await.is_err());

        for n in 0..10u8 {
            let job = SettlementJob::loss(RoundId::new([n; 16]), PlayerId::new([1; 16]), 1, Multiplier::ONE);
            connector.settle(&job).await.unwrap();
        }
        assert_eq!(connector.tracked().await, 3);

        connector.settle(&pending).await.unwrap();
        assert_eq!(ledger.get_balance(player).await, Ok(10_200));
        assert_eq!(ledger.adjust_calls().await, 11);
    }
}
