//! Round Driver
//!
//! Runs the round state machine on a single task. Requests arrive over a
//! command channel and are applied in arrival order; snapshots and events
//! leave on a broadcast channel. Terminal bet outcomes are queued for the
//! settlement worker and never awaited here.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::core::ids::{PlayerId, RoundId};
use crate::core::multiplier::Multiplier;
use crate::game::events::RoundEvent;
use crate::game::ledger::{Bet, PlayerProfile, RejectionReason};
use crate::game::machine::RoundMachine;
use crate::game::round::RoundSnapshot;
use crate::settlement::{SettlementJob, SettlementSender};

// =============================================================================
// CONFIG
// =============================================================================

/// Driver tuning.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Snapshot cadence while running.
    pub tick_interval: Duration,
    /// Pending requests before senders wait.
    pub command_buffer: usize,
    /// Broadcast messages buffered per subscriber.
    pub broadcast_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            command_buffer: 1024,
            broadcast_capacity: 256,
        }
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Why a snapshot was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    /// The phase changed.
    Transition,
    /// Periodic multiplier update.
    Tick,
    /// A bet was placed or cashed out, by request or by its auto-cashout.
    Update,
    /// Requested by a single client.
    Resync,
}

/// Snapshot with its sequence number.
#[derive(Debug, Clone)]
pub struct PublishedSnapshot {
    /// Strictly increasing across every snapshot the driver builds.
    pub seq: u64,
    /// Why it was built.
    pub reason: SnapshotReason,
    /// Round state.
    pub snapshot: RoundSnapshot,
}

/// What the driver broadcasts.
#[derive(Debug, Clone)]
pub enum RoundBroadcast {
    /// Full round state.
    Snapshot(Arc<PublishedSnapshot>),
    /// A round event.
    Event(Arc<RoundEvent>),
}

/// An accepted join or cashout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Round the request applied to.
    pub round_id: RoundId,
    /// The bet after the request.
    pub bet: Bet,
}

/// Why a request through [`RoundHandle`] failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundRequestError {
    /// The round refused the request.
    #[error(transparent)]
    Rejected(#[from] RejectionReason),

    /// The driver task is gone.
    #[error("round driver is not running")]
    DriverStopped,
}

type Reply<T> = oneshot::Sender<T>;

enum RoundCommand {
    Join {
        profile: PlayerProfile,
        stake: i64,
        auto_cashout: Option<Multiplier>,
        round_id: Option<RoundId>,
        requested_at: Instant,
        reply: Reply<Result<Accepted, RejectionReason>>,
    },
    Cashout {
        player_id: PlayerId,
        round_id: Option<RoundId>,
        requested_at: Instant,
        reply: Reply<Result<Accepted, RejectionReason>>,
    },
    Snapshot {
        reply: Reply<Arc<PublishedSnapshot>>,
    },
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable access to the driver.
#[derive(Clone)]
pub struct RoundHandle {
    commands: mpsc::Sender<RoundCommand>,
    broadcast: broadcast::Sender<RoundBroadcast>,
}

impl RoundHandle {
    /// Place a bet received at `requested_at`, optionally with an
    /// auto-cashout target.
    pub async fn join(
        &self,
        profile: PlayerProfile,
        stake: i64,
        auto_cashout: Option<Multiplier>,
        round_id: Option<RoundId>,
        requested_at: Instant,
    ) -> Result<Accepted, RoundRequestError> {
        let (reply, rx) = oneshot::channel();
        let command = RoundCommand::Join { profile, stake, auto_cashout, round_id, requested_at, reply };
        self.send(command).await?;
        Ok(rx.await.map_err(|_| RoundRequestError::DriverStopped)??)
    }

    /// Cash out a bet, priced at `requested_at`.
    pub async fn cashout(
        &self,
        player_id: PlayerId,
        round_id: Option<RoundId>,
        requested_at: Instant,
    ) -> Result<Accepted, RoundRequestError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoundCommand::Cashout { player_id, round_id, requested_at, reply }).await?;
        Ok(rx.await.map_err(|_| RoundRequestError::DriverStopped)??)
    }

    /// Fresh snapshot of the round, not broadcast.
    pub async fn snapshot(&self) -> Result<Arc<PublishedSnapshot>, RoundRequestError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoundCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| RoundRequestError::DriverStopped)
    }

    /// Receive every snapshot and event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RoundBroadcast> {
        self.broadcast.subscribe()
    }

    async fn send(&self, command: RoundCommand) -> Result<(), RoundRequestError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RoundRequestError::DriverStopped)
    }
}

// =============================================================================
// DRIVER
// =============================================================================

/// Owns the round machine and its clock.
pub struct RoundDriver {
    machine: RoundMachine,
    commands: mpsc::Receiver<RoundCommand>,
    broadcast: broadcast::Sender<RoundBroadcast>,
    settlement: SettlementSender,
    tick_interval: Duration,
    seq: u64,
}

impl RoundDriver {
    /// Create a driver and its handle. Subscribe before calling [`run`](Self::run)
    /// to see the first round's creation.
    pub fn new(
        machine: RoundMachine,
        settlement: SettlementSender,
        config: DriverConfig,
    ) -> (Self, RoundHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));

        let handle = RoundHandle {
            commands: command_tx,
            broadcast: broadcast_tx.clone(),
        };
        let driver = Self {
            machine,
            commands: command_rx,
            broadcast: broadcast_tx,
            settlement,
            tick_interval: config.tick_interval,
            seq: 0,
        };
        (driver, handle)
    }

    /// Create a driver and run it on its own task.
    pub fn spawn(
        machine: RoundMachine,
        settlement: SettlementSender,
        config: DriverConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (RoundHandle, JoinHandle<()>) {
        let (driver, handle) = Self::new(machine, settlement, config);
        (handle, tokio::spawn(driver.run(shutdown)))
    }

    /// Drive rounds until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(round = %self.machine.round().id().short(), "Round driver started");

        let now = Instant::now();
        self.flush_events();
        self.publish(now, SnapshotReason::Transition);
        self.step(now);

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // Recomputed every pass, so a superseded deadline never fires.
            let deadline = self.machine.next_deadline();
            let running = self.machine.is_running();

            tokio::select! {
                // Queued requests first: one received before a deadline must
                // be evaluated before the timer moves the round past it.
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },

                _ = shutdown.recv() => break,

                _ = sleep_until(deadline) => self.step(Instant::now()),

                _ = ticker.tick(), if running => {
                    let now = Instant::now();
                    self.step(now);
                    if self.machine.is_running() {
                        self.publish(now, SnapshotReason::Tick);
                    }
                }
            }
        }

        info!(rounds = self.machine.rounds_created(), "Round driver stopped");
    }

    fn handle(&mut self, command: RoundCommand) {
        match command {
            RoundCommand::Join { profile, stake, auto_cashout, round_id, requested_at, reply } => {
                self.step(requested_at);
                let result = self
                    .machine
                    .join_with_auto_cashout(requested_at, profile, stake, auto_cashout, round_id)
                    .map(|bet| Accepted { round_id: self.machine.round().id(), bet });
                self.after_request(result.is_ok());
                let _ = reply.send(result);
            }
            RoundCommand::Cashout { player_id, round_id, requested_at, reply } => {
                self.step(requested_at);
                let result = self
                    .machine
                    .cashout(requested_at, &player_id, round_id)
                    .map(|bet| Accepted { round_id: self.machine.round().id(), bet });
                self.after_request(result.is_ok());
                let _ = reply.send(result);
            }
            RoundCommand::Snapshot { reply } => {
                let now = Instant::now();
                self.step(now);
                let _ = reply.send(self.build(now, SnapshotReason::Resync));
            }
        }
    }

    fn after_request(&mut self, mutated: bool) {
        let now = Instant::now();
        self.flush_events();
        self.step(now);
        if mutated {
            self.publish(now, SnapshotReason::Update);
        }
    }

    /// Apply every transition and auto-cashout due at `at`, publishing
    /// after each batch.
    fn step(&mut self, at: Instant) {
        while self.machine.advance(at) > 0 {
            let reason = if self.flush_events() {
                SnapshotReason::Transition
            } else {
                SnapshotReason::Update
            };
            self.publish(at, reason);
        }
    }

    /// Publish pending events. Returns whether any changed the phase.
    fn flush_events(&mut self) -> bool {
        let mut transition = false;
        for event in self.machine.take_events() {
            transition |= event.is_transition();
            self.enqueue_settlement(&event);
            debug!(event = event.name(), round = %event.round_id().short(), "Publishing event");
            // No subscribers is not an error.
            let _ = self.broadcast.send(RoundBroadcast::Event(Arc::new(event)));
        }
        transition
    }

    fn enqueue_settlement(&self, event: &RoundEvent) {
        let jobs = match event {
            RoundEvent::PlayerCashedOut { round_id, player_id, stake, multiplier, .. } => {
                vec![SettlementJob::cashout(*round_id, *player_id, *stake, *multiplier)]
            }
            RoundEvent::RoundCrashed { round_id, crash_point, losses, .. } => losses
                .iter()
                .map(|bet| SettlementJob::loss(*round_id, bet.player_id, bet.stake, *crash_point))
                .collect(),
            _ => return,
        };

        for job in jobs {
            if let Err(e) = self.settlement.send(job) {
                error!(
                    round = %e.0.round_id.short(),
                    player = %e.0.player_id.short(),
                    "Settlement queue closed, outcome not settled"
                );
            }
        }
    }

    fn build(&mut self, now: Instant, reason: SnapshotReason) -> Arc<PublishedSnapshot> {
        self.seq += 1;
        Arc::new(PublishedSnapshot {
            seq: self.seq,
            reason,
            snapshot: self.machine.snapshot(now),
        })
    }

    fn publish(&mut self, now: Instant, reason: SnapshotReason) {
        let snapshot = self.build(now, reason);
        let _ = self.broadcast.send(RoundBroadcast::Snapshot(snapshot));
    }
}
