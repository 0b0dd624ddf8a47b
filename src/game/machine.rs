//! Round State Machine
//!
//! Owns the single live round and drives it through
//! WAITING → RUNNING → CRASHED → WAITING.
//!
//! The machine is synchronous and clock-free: every operation takes the
//! instant it applies to. Before evaluating a request it applies every
//! transition due at or before the request's instant, so a crash that was
//! due first always wins, and a cashout received before the crash instant is
//! honored at the multiplier of its receive instant.
//!
//! Bets may carry an auto-cashout target. While running, each target below
//! the crash point is its own deadline and fires at exactly the target;
//! a target at or above the crash point never fires and the bet loses.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::ids::{PlayerId, RoundId};
use crate::core::multiplier::Multiplier;
use crate::fairness::{CrashPointConfig, ServerSecret, generate_crash_point_with};
use crate::game::curve::GrowthCurve;
use crate::game::events::RoundEvent;
use crate::game::ledger::{Bet, PlayerProfile, RejectionReason, MIN_AUTO_CASHOUT};
use crate::game::round::{CrashHistory, Round, RoundPhase, RoundSnapshot, DEFAULT_HISTORY_LEN};

// =============================================================================
// CONFIG
// =============================================================================

/// Timing, curve and stake parameters for every round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundConfig {
    /// Countdown before a round starts running.
    pub wait_duration: Duration,
    /// Pause between a crash and the next round.
    pub cooldown: Duration,
    /// Joins still accepted this long after the round starts. Zero disables.
    pub join_grace: Duration,
    /// Multiplier growth curve.
    pub curve: GrowthCurve,
    /// Past crash points kept.
    pub history_len: usize,
    /// Smallest accepted stake.
    pub min_stake: u64,
    /// Largest accepted stake.
    pub max_stake: u64,
    /// Crash point distribution.
    pub crash: CrashPointConfig,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            wait_duration: Duration::from_secs(7),
            cooldown: Duration::from_secs(3),
            join_grace: Duration::ZERO,
            curve: GrowthCurve::default(),
            history_len: DEFAULT_HISTORY_LEN,
            min_stake: 1,
            max_stake: 1_000_000,
            crash: CrashPointConfig::default(),
        }
    }
}

// =============================================================================
// MACHINE
// =============================================================================

/// Single writer of round state.
pub struct RoundMachine {
    config: RoundConfig,
    secret: ServerSecret,
    round: Round,
    history: CrashHistory,
    events: Vec<RoundEvent>,
    rounds_created: u64,
}

impl RoundMachine {
    /// Create the machine with a fresh round waiting from `now`.
    pub fn new(config: RoundConfig, secret: ServerSecret, now: Instant) -> Self {
        Self::with_first_round(config, secret, now, RoundId::generate())
    }

    /// Create the machine with a chosen id for the first round.
    pub fn with_first_round(
        config: RoundConfig,
        secret: ServerSecret,
        now: Instant,
        round_id: RoundId,
    ) -> Self {
        let history = CrashHistory::new(config.history_len);
        let round = build_round(&config, &secret, round_id, now);
        let mut machine = Self {
            config,
            secret,
            round,
            history,
            events: Vec::new(),
            rounds_created: 0,
        };
        machine.on_round_created();
        machine
    }

    /// Configuration in use.
    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    /// The live round.
    pub fn round(&self) -> &Round {
        &self.round
    }

    /// Past crash points.
    pub fn history(&self) -> &CrashHistory {
        &self.history
    }

    /// Rounds created since start, including the current one.
    pub fn rounds_created(&self) -> u64 {
        self.rounds_created
    }

    /// Whether the multiplier is currently growing.
    pub fn is_running(&self) -> bool {
        matches!(self.round.phase(), RoundPhase::Running { .. })
    }

    /// Instant of the next scheduled transition or auto-cashout.
    pub fn next_deadline(&self) -> Instant {
        let deadline = self.round.phase().deadline();
        match *self.round.phase() {
            RoundPhase::Running { started_at, .. } => self
                .next_auto_cashout(started_at)
                .map_or(deadline, |(_, _, due)| due.min(deadline)),
            _ => deadline,
        }
    }

    /// Drain events emitted since the last call.
    pub fn take_events(&mut self) -> Vec<RoundEvent> {
        std::mem::take(&mut self.events)
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    /// Apply transitions due at or before `at`. Returns how many fired.
    ///
    /// Stops after a crash and after creating a round, so the caller can
    /// publish the crashed round before its successor exists. Call again
    /// until it returns zero to catch up fully.
    pub fn advance(&mut self, at: Instant) -> usize {
        let mut applied = 0;
        loop {
            match *self.round.phase() {
                RoundPhase::Waiting { starts_at, .. } if at >= starts_at => {
                    self.start(starts_at);
                    applied += 1;
                }
                RoundPhase::Running { started_at, crash_at } => {
                    if let Some((player_id, target, due)) = self.next_auto_cashout(started_at) {
                        if due <= at {
                            self.auto_cashout(player_id, target);
                            applied += 1;
                            continue;
                        }
                    }
                    if at >= crash_at {
                        self.crash(started_at, crash_at);
                    } else if self.sample(started_at, at) >= self.round.crash_point() {
                        self.crash(started_at, at);
                    } else {
                        break;
                    }
                    return applied + 1;
                }
                RoundPhase::Crashed { next_round_at, .. } if at >= next_round_at => {
                    self.next_round(next_round_at);
                    return applied + 1;
                }
                _ => break,
            }
        }
        applied
    }

    fn catch_up(&mut self, at: Instant) {
        while self.advance(at) > 0 {}
    }

    fn start(&mut self, started_at: Instant) {
        let crash_at = started_at + self.config.curve.time_to_reach(self.round.crash_point());
        self.round.set_phase(RoundPhase::Running { started_at, crash_at });

        info!(
            round = %self.round.id().short(),
            players = self.round.ledger().len(),
            staked = self.round.ledger().total_staked(),
            "Round started"
        );
        self.events.push(RoundEvent::RoundStarted { round_id: self.round.id() });
    }

    fn crash(&mut self, started_at: Instant, crashed_at: Instant) {
        let crash_point = self.round.crash_point();
        self.round.set_phase(RoundPhase::Crashed {
            started_at,
            crashed_at,
            next_round_at: crashed_at + self.config.cooldown,
        });
        self.history.push(crash_point);

        let losses: Vec<Bet> = self.round.ledger().active().cloned().collect();
        info!(
            round = %self.round.id().short(),
            crash_point = %crash_point,
            losses = losses.len(),
            "Round crashed"
        );

        if let Some(reveal) = self.round.reveal() {
            self.events.push(RoundEvent::RoundCrashed {
                round_id: self.round.id(),
                crash_point,
                losses,
                reveal,
            });
        }
    }

    fn next_round(&mut self, created_at: Instant) {
        self.round = build_round(&self.config, &self.secret, RoundId::generate(), created_at);
        self.on_round_created();
    }

    fn on_round_created(&mut self) {
        self.rounds_created += 1;
        debug!(
            round = %self.round.id().short(),
            commitment = %self.round.commitment().to_hex(),
            "Round created"
        );
        self.events.push(RoundEvent::RoundCreated {
            round_id: self.round.id(),
            commitment: self.round.commitment().clone(),
            starts_in: self.config.wait_duration,
        });
    }

    fn sample(&self, started_at: Instant, at: Instant) -> Multiplier {
        self.config.curve.multiplier_at(at.saturating_duration_since(started_at))
    }

    /// Earliest pending auto-cashout that fires before the crash.
    fn next_auto_cashout(&self, started_at: Instant) -> Option<(PlayerId, Multiplier, Instant)> {
        let crash_point = self.round.crash_point();
        self.round
            .ledger()
            .active()
            .filter_map(|bet| {
                let target = bet.auto_cashout.filter(|t| *t < crash_point)?;
                let due = started_at + self.config.curve.time_to_reach(target);
                Some((bet.player_id, target, due))
            })
            .min_by_key(|(_, _, due)| *due)
    }

    fn auto_cashout(&mut self, player_id: PlayerId, target: Multiplier) {
        if let Ok(bet) = self.round.ledger_mut().cashout(&player_id, target).cloned() {
            self.record_cashout(&bet, target, true);
        }
    }

    fn record_cashout(&mut self, bet: &Bet, multiplier: Multiplier, automatic: bool) {
        let payout = multiplier.payout(bet.stake);
        debug!(
            round = %self.round.id().short(),
            player = %bet.player_id.short(),
            multiplier = %multiplier,
            payout,
            automatic,
            "Cashed out"
        );
        self.events.push(RoundEvent::PlayerCashedOut {
            round_id: self.round.id(),
            player_id: bet.player_id,
            display_name: bet.display_name.clone(),
            stake: bet.stake,
            multiplier,
            payout,
            automatic,
        });
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    /// Place a bet received at `at`.
    pub fn join(
        &mut self,
        at: Instant,
        profile: PlayerProfile,
        stake: i64,
        round_id: Option<RoundId>,
    ) -> Result<Bet, RejectionReason> {
        self.join_with_auto_cashout(at, profile, stake, None, round_id)
    }

    /// Place a bet received at `at`, cashed out by the server once the
    /// multiplier reaches `auto_cashout`.
    pub fn join_with_auto_cashout(
        &mut self,
        at: Instant,
        profile: PlayerProfile,
        stake: i64,
        auto_cashout: Option<Multiplier>,
        round_id: Option<RoundId>,
    ) -> Result<Bet, RejectionReason> {
        self.catch_up(at);
        self.check_round(round_id)?;

        // Received while an earlier round was still current.
        if at < self.round.created_at() {
            return Err(RejectionReason::InvalidPhase);
        }

        let open = match *self.round.phase() {
            RoundPhase::Waiting { .. } => true,
            RoundPhase::Running { started_at, .. } => at < started_at + self.config.join_grace,
            RoundPhase::Crashed { .. } => false,
        };
        if !open {
            return Err(RejectionReason::InvalidPhase);
        }

        let stake = self.validate_stake(stake)?;
        if let Some(target) = auto_cashout {
            self.validate_auto_cashout(target, at)?;
        }
        let bet = self.round.ledger_mut().join(profile, stake, auto_cashout)?.clone();

        debug!(
            round = %self.round.id().short(),
            player = %bet.player_id.short(),
            stake = bet.stake,
            auto_cashout = ?bet.auto_cashout.map(|m| m.to_string()),
            "Bet placed"
        );
        self.events.push(RoundEvent::PlayerJoined {
            round_id: self.round.id(),
            bet: bet.clone(),
        });
        Ok(bet)
    }

    /// Cash out a bet at the multiplier of `at`.
    pub fn cashout(
        &mut self,
        at: Instant,
        player_id: &PlayerId,
        round_id: Option<RoundId>,
    ) -> Result<Bet, RejectionReason> {
        self.catch_up(at);
        self.check_round(round_id)?;

        let started_at = match *self.round.phase() {
            RoundPhase::Running { started_at, .. } if at >= started_at => started_at,
            _ => return Err(RejectionReason::InvalidPhase),
        };

        // Still running after advance(at), so the sample is below the crash point.
        let multiplier = self.sample(started_at, at);
        debug_assert!(multiplier < self.round.crash_point());

        let bet = self.round.ledger_mut().cashout(player_id, multiplier)?.clone();
        self.record_cashout(&bet, multiplier, false);
        Ok(bet)
    }

    fn check_round(&self, round_id: Option<RoundId>) -> Result<(), RejectionReason> {
        match round_id {
            Some(id) if id != self.round.id() => Err(RejectionReason::InvalidPhase),
            _ => Ok(()),
        }
    }

    fn validate_stake(&self, stake: i64) -> Result<u64, RejectionReason> {
        if stake <= 0 {
            return Err(RejectionReason::invalid_stake(stake, "stake must be positive"));
        }
        let amount = stake as u64;
        if amount < self.config.min_stake {
            return Err(RejectionReason::invalid_stake(
                stake,
                format!("minimum stake is {}", self.config.min_stake),
            ));
        }
        if amount > self.config.max_stake {
            return Err(RejectionReason::invalid_stake(
                stake,
                format!("maximum stake is {}", self.config.max_stake),
            ));
        }
        Ok(amount)
    }

    fn validate_auto_cashout(&self, target: Multiplier, at: Instant) -> Result<(), RejectionReason> {
        if target < MIN_AUTO_CASHOUT {
            return Err(RejectionReason::invalid_auto_cashout(
                target,
                format!("minimum is {}", MIN_AUTO_CASHOUT),
            ));
        }
        let max = self.config.crash.max_multiplier;
        if target > max {
            return Err(RejectionReason::invalid_auto_cashout(target, format!("maximum is {}", max)));
        }
        // Joining inside the grace window after the curve already passed it.
        if let RoundPhase::Running { started_at, .. } = *self.round.phase() {
            if self.sample(started_at, at) >= target {
                return Err(RejectionReason::invalid_auto_cashout(target, "target already passed"));
            }
        }
        Ok(())
    }

    // =========================================================================
    // SNAPSHOT
    // =========================================================================

    /// Broadcast-safe view of the round at `now`. Callers advance first.
    pub fn snapshot(&self, now: Instant) -> RoundSnapshot {
        let crash_point = self.round.crash_point();
        let (current_multiplier, waiting_seconds_remaining) = match *self.round.phase() {
            RoundPhase::Waiting { starts_at, .. } => {
                let remaining = starts_at.saturating_duration_since(now);
                (Multiplier::ONE, Some(whole_seconds_ceil(remaining)))
            }
            RoundPhase::Running { started_at, .. } => {
                let below_crash = Multiplier::from_hundredths(crash_point.hundredths().saturating_sub(1));
                (self.sample(started_at, now).min(below_crash), None)
            }
            RoundPhase::Crashed { .. } => (crash_point, None),
        };

        RoundSnapshot {
            round_id: self.round.id(),
            phase: self.round.phase().kind(),
            current_multiplier,
            waiting_seconds_remaining,
            history: self.history.to_vec(),
            players: self.round.ledger().bets().cloned().collect(),
            commitment: self.round.commitment().clone(),
            reveal: self.round.reveal(),
        }
    }
}

fn build_round(config: &RoundConfig, secret: &ServerSecret, id: RoundId, created_at: Instant) -> Round {
    let round_secret = secret.derive_round_secret(&id);
    let crash_point = generate_crash_point_with(&round_secret, &id, &config.crash);
    Round::new(
        id,
        round_secret,
        crash_point,
        RoundPhase::Waiting {
            created_at,
            starts_at: created_at + config.wait_duration,
        },
    )
}

fn whole_seconds_ceil(d: Duration) -> u64 {
    let millis = d.as_millis() as u64;
    millis.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::round::PhaseKind;
    use proptest::prelude::*;

    fn master() -> ServerSecret {
        ServerSecret::new([0x5A; 32]).unwrap()
    }

    fn profile(n: u8) -> PlayerProfile {
        PlayerProfile::new(PlayerId::new([n; 16]), format!("p{}", n), None)
    }

    /// First round id whose crash point satisfies `want`.
    fn round_with_crash(config: &RoundConfig, want: impl Fn(Multiplier) -> bool) -> RoundId {
        let secret = master();
        (0u32..1_000_000)
            .map(|i| {
                let mut bytes = [0u8; 16];
                bytes[..4].copy_from_slice(&i.to_be_bytes());
                RoundId::new(bytes)
            })
            .find(|id| want(generate_crash_point_with(&secret.derive_round_secret(id), id, &config.crash)))
            .expect("no round id with the requested crash point")
    }

    fn machine_with_crash(want: impl Fn(Multiplier) -> bool) -> (RoundMachine, Instant) {
        let config = RoundConfig::default();
        let id = round_with_crash(&config, want);
        let now = Instant::now();
        (RoundMachine::with_first_round(config, master(), now, id), now)
    }

    fn crash_events(events: &[RoundEvent]) -> Vec<(Multiplier, Vec<Bet>)> {
        events
            .iter()
            .filter_map(|e| match e {
                RoundEvent::RoundCrashed { crash_point, losses, .. } => Some((*crash_point, losses.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_initial_state() {
        let now = Instant::now();
        let mut machine = RoundMachine::new(RoundConfig::default(), master(), now);
        let snap = machine.snapshot(now);

        assert_eq!(snap.phase, PhaseKind::Waiting);
        assert_eq!(snap.current_multiplier, Multiplier::ONE);
        assert_eq!(snap.waiting_seconds_remaining, Some(7));
        assert!(snap.history.is_empty());
        assert!(snap.reveal.is_none());
        assert_eq!(machine.next_deadline(), now + Duration::from_secs(7));

        let events = machine.take_events();
        assert!(matches!(events[..], [RoundEvent::RoundCreated { .. }]));
    }

    #[test]
    fn test_waiting_countdown_rounds_up() {
        let now = Instant::now();
        let machine = RoundMachine::new(RoundConfig::default(), master(), now);
        let snap = machine.snapshot(now + Duration::from_millis(1_500));
        assert_eq!(snap.waiting_seconds_remaining, Some(6));
    }

    #[test]
    fn test_scenario_a_cashout_at_two() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() >= 300);

        let bet = machine.join(t0 + Duration::from_secs(1), profile(1), 100, None).unwrap();
        assert_eq!(bet.stake, 100);

        let started = t0 + Duration::from_secs(7);
        machine.advance(started);
        assert!(machine.is_running());

        let two = Multiplier::from_hundredths(200);
        let at = started + machine.config().curve.time_to_reach(two);
        let bet = machine.cashout(at, &PlayerId::new([1; 16]), None).unwrap();

        assert_eq!(bet.cashout, Some(two));
        assert_eq!(bet.payout(), Some(200));
        assert_eq!(two.profit(bet.stake), 100);
    }

    #[test]
    fn test_scenario_b_crash_loses_uncashed_bet() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() == 173);
        let round_id = machine.round().id();

        machine.join(t0, profile(2), 50, Some(round_id)).unwrap();
        machine.advance(t0 + Duration::from_secs(60));

        let snap = machine.snapshot(t0 + Duration::from_secs(60));
        assert_eq!(snap.phase, PhaseKind::Crashed);
        assert_eq!(snap.current_multiplier.hundredths(), 173);

        let crashes = crash_events(&machine.take_events());
        assert_eq!(crashes.len(), 1);
        let (crash_point, losses) = &crashes[0];
        assert_eq!(crash_point.hundredths(), 173);
        assert_eq!(losses.len(), 1);
        assert_eq!(losses[0].stake, 50);
        assert_eq!(machine.history().to_vec(), vec![Multiplier::from_hundredths(173)]);
    }

    #[test]
    fn test_scenario_c_duplicate_bet() {
        let now = Instant::now();
        let mut machine = RoundMachine::new(RoundConfig::default(), master(), now);
        machine.join(now, profile(3), 10, None).unwrap();
        assert_eq!(
            machine.join(now, profile(3), 20, None),
            Err(RejectionReason::DuplicateBet)
        );
        assert_eq!(machine.round().ledger().len(), 1);
    }

    #[test]
    fn test_scenario_d_stale_cashout() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() >= 150);
        let old_round = machine.round().id();
        let player = PlayerId::new([4; 16]);
        machine.join(t0, profile(4), 25, None).unwrap();

        machine.advance(machine.next_deadline() + Duration::from_secs(120));
        assert_eq!(machine.round().phase().kind(), PhaseKind::Crashed);
        machine.take_events();

        let before_next = machine.next_deadline() - Duration::from_millis(1);
        assert_eq!(
            machine.cashout(before_next, &player, Some(old_round)),
            Err(RejectionReason::InvalidPhase)
        );
        assert_eq!(
            machine.cashout(before_next, &player, None),
            Err(RejectionReason::InvalidPhase)
        );
        assert_eq!(machine.round().ledger().get(&player).unwrap().cashout, None);
        assert!(machine.take_events().is_empty());

        // After the next round exists the old id is stale.
        let next = machine.next_deadline();
        machine.advance(next);
        assert_ne!(machine.round().id(), old_round);
        assert_eq!(
            machine.cashout(next, &player, Some(old_round)),
            Err(RejectionReason::InvalidPhase)
        );
    }

    #[test]
    fn test_scenario_e_history_keeps_eight() {
        let now = Instant::now();
        let mut machine = RoundMachine::new(RoundConfig::default(), master(), now);
        let mut crashes = Vec::new();

        while crashes.len() < 9 {
            let deadline = machine.next_deadline();
            machine.advance(deadline);
            crashes.extend(crash_events(&machine.take_events()).into_iter().map(|(m, _)| m));
        }

        let expected: Vec<Multiplier> = crashes.iter().rev().take(8).copied().collect();
        assert_eq!(machine.history().to_vec(), expected);
        assert_eq!(machine.history().len(), 8);
    }

    #[test]
    fn test_join_rejected_while_running() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() >= 200);
        let started = t0 + Duration::from_secs(7);
        assert_eq!(
            machine.join(started + Duration::from_millis(10), profile(5), 10, None),
            Err(RejectionReason::InvalidPhase)
        );
    }

    #[test]
    fn test_join_grace_window() {
        let mut config = RoundConfig::default();
        config.join_grace = Duration::from_millis(500);
        let id = round_with_crash(&config, |m| m.hundredths() >= 200);
        let t0 = Instant::now();
        let mut machine = RoundMachine::with_first_round(config, master(), t0, id);

        let started = t0 + Duration::from_secs(7);
        assert!(machine.join(started + Duration::from_millis(100), profile(6), 10, None).is_ok());
        assert_eq!(
            machine.join(started + Duration::from_millis(600), profile(7), 10, None),
            Err(RejectionReason::InvalidPhase)
        );
    }

    #[test]
    fn test_join_received_before_start_is_honored() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() >= 200);
        machine.advance(t0 + Duration::from_secs(8));
        assert!(machine.is_running());

        // Received during the countdown, processed after the start.
        assert!(machine.join(t0 + Duration::from_secs(6), profile(8), 10, None).is_ok());
    }

    #[test]
    fn test_stake_validation() {
        let now = Instant::now();
        let mut machine = RoundMachine::new(RoundConfig::default(), master(), now);

        for stake in [0i64, -5, 1_000_001] {
            assert!(matches!(
                machine.join(now, profile(9), stake, None),
                Err(RejectionReason::InvalidStake { .. })
            ));
        }
        assert!(machine.round().ledger().is_empty());
    }

    #[test]
    fn test_cashout_without_bet() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() >= 200);
        let at = t0 + Duration::from_secs(8);
        assert_eq!(
            machine.cashout(at, &PlayerId::new([1; 16]), None),
            Err(RejectionReason::UnknownBet)
        );
    }

    #[test]
    fn test_cashout_in_waiting_rejected() {
        let now = Instant::now();
        let mut machine = RoundMachine::new(RoundConfig::default(), master(), now);
        machine.join(now, profile(1), 10, None).unwrap();
        assert_eq!(
            machine.cashout(now, &PlayerId::new([1; 16]), None),
            Err(RejectionReason::InvalidPhase)
        );
    }

    #[test]
    fn test_instant_crash() {
        let (mut machine, t0) = machine_with_crash(|m| m == Multiplier::ONE);
        machine.join(t0, profile(1), 10, None).unwrap();
        machine.advance(t0 + Duration::from_secs(7));

        assert_eq!(machine.round().phase().kind(), PhaseKind::Crashed);
        let crashes = crash_events(&machine.take_events());
        assert_eq!(crashes[0].0, Multiplier::ONE);
        assert_eq!(crashes[0].1.len(), 1);
    }

    #[test]
    fn test_reveal_matches_live_crash_point() {
        let now = Instant::now();
        let config = RoundConfig::default();
        let mut machine = RoundMachine::new(config.clone(), master(), now);
        let commitment = machine.round().commitment().clone();

        machine.advance(now + Duration::from_secs(600));
        let reveal = machine.round().reveal().unwrap();

        assert!(reveal.verify(&commitment, &config.crash).is_ok());
        assert_eq!(
            generate_crash_point_with(&reveal.round_secret, &reveal.round_id, &config.crash),
            machine.history().to_vec()[0]
        );
    }

    #[test]
    fn test_new_round_only_after_cooldown() {
        let now = Instant::now();
        let mut machine = RoundMachine::new(RoundConfig::default(), master(), now);
        let first = machine.round().id();

        machine.advance(now + Duration::from_secs(600));
        assert_eq!(machine.round().id(), first);
        let next_round_at = machine.next_deadline();
        let crashed_at = match *machine.round().phase() {
            RoundPhase::Crashed { crashed_at, .. } => crashed_at,
            _ => panic!("expected crashed"),
        };
        assert_eq!(next_round_at, crashed_at + Duration::from_secs(3));

        machine.advance(next_round_at - Duration::from_millis(1));
        assert_eq!(machine.round().id(), first);

        machine.advance(next_round_at);
        assert_ne!(machine.round().id(), first);
        assert_eq!(machine.round().phase().kind(), PhaseKind::Waiting);
        assert!(machine.round().ledger().is_empty());
        assert_eq!(machine.rounds_created(), 2);
    }

    #[test]
    fn test_running_snapshot_hides_crash_point() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() >= 500);
        let at = t0 + Duration::from_secs(9);
        machine.advance(at);

        let snap = machine.snapshot(at);
        assert_eq!(snap.phase, PhaseKind::Running);
        assert!(snap.reveal.is_none());
        assert!(snap.current_multiplier > Multiplier::ONE);
        assert!(machine.round().revealed_crash_point().is_none());
    }

    fn cashout_events(events: &[RoundEvent]) -> Vec<(PlayerId, Multiplier, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                RoundEvent::PlayerCashedOut { player_id, multiplier, automatic, .. } => {
                    Some((*player_id, *multiplier, *automatic))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_auto_cashout_fires_at_target() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() >= 300);
        let two = Multiplier::from_hundredths(200);
        let bet = machine.join_with_auto_cashout(t0, profile(1), 100, Some(two), None).unwrap();
        assert_eq!(bet.auto_cashout, Some(two));

        let started = t0 + Duration::from_secs(7);
        machine.advance(started);
        let due = started + machine.config().curve.time_to_reach(two);
        assert_eq!(machine.next_deadline(), due);
        machine.take_events();

        machine.advance(due - Duration::from_millis(1));
        assert!(machine.round().ledger().get(&PlayerId::new([1; 16])).unwrap().is_active());

        assert_eq!(machine.advance(due), 1);
        assert!(machine.is_running());
        let bet = machine.round().ledger().get(&PlayerId::new([1; 16])).unwrap();
        assert_eq!(bet.cashout, Some(two));
        assert_eq!(bet.payout(), Some(200));
        assert_eq!(
            cashout_events(&machine.take_events()),
            vec![(PlayerId::new([1; 16]), two, true)]
        );

        assert_eq!(machine.next_deadline(), machine.round().phase().deadline());
        let manual = machine.cashout(due + Duration::from_millis(10), &PlayerId::new([1; 16]), None);
        assert_eq!(manual, Err(RejectionReason::AlreadyCashedOut));
    }

    #[test]
    fn test_auto_cashout_at_or_above_crash_loses() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() == 173);
        let at_crash = Multiplier::from_hundredths(173);
        let above = Multiplier::from_hundredths(250);
        machine.join_with_auto_cashout(t0, profile(1), 10, Some(at_crash), None).unwrap();
        machine.join_with_auto_cashout(t0, profile(2), 10, Some(above), None).unwrap();

        machine.advance(t0 + Duration::from_secs(7));
        let crash_at = machine.round().phase().deadline();
        assert_eq!(machine.next_deadline(), crash_at);

        machine.advance(t0 + Duration::from_secs(60));
        let events = machine.take_events();
        assert!(cashout_events(&events).is_empty());
        let crashes = crash_events(&events);
        assert_eq!(crashes.len(), 1);
        assert_eq!(crashes[0].1.len(), 2);
    }

    #[test]
    fn test_auto_cashout_before_crash_among_several() {
        let (mut machine, t0) = machine_with_crash(|m| m.hundredths() >= 400);
        machine
            .join_with_auto_cashout(t0, profile(1), 10, Some(Multiplier::from_hundredths(300)), None)
            .unwrap();
        machine
            .join_with_auto_cashout(t0, profile(2), 10, Some(Multiplier::from_hundredths(150)), None)
            .unwrap();
        machine.join(t0, profile(3), 10, None).unwrap();
        machine.take_events();

        // One late advance applies both targets in deadline order.
        let started = t0 + Duration::from_secs(7);
        let at = started + machine.config().curve.time_to_reach(Multiplier::from_hundredths(300));
        machine.advance(at);

        let fired: Vec<u32> = cashout_events(&machine.take_events())
            .iter()
            .map(|(_, m, _)| m.hundredths())
            .collect();
        assert_eq!(fired, vec![150, 300]);
        assert!(machine.round().ledger().get(&PlayerId::new([3; 16])).unwrap().is_active());
    }

    #[test]
    fn test_auto_cashout_target_validated() {
        let now = Instant::now();
        let config = RoundConfig::default();
        let max = config.crash.max_multiplier;
        let mut machine = RoundMachine::new(config, master(), now);

        for target in [Multiplier::ONE, Multiplier::from_hundredths(max.hundredths() + 1)] {
            assert!(matches!(
                machine.join_with_auto_cashout(now, profile(1), 10, Some(target), None),
                Err(RejectionReason::InvalidAutoCashout { .. })
            ));
        }
        assert!(machine.round().ledger().is_empty());

        assert!(machine.join_with_auto_cashout(now, profile(1), 10, Some(MIN_AUTO_CASHOUT), None).is_ok());
        assert!(machine.join_with_auto_cashout(now, profile(2), 10, Some(max), None).is_ok());
    }

    #[test]
    fn test_auto_cashout_already_passed_in_grace_window() {
        let mut config = RoundConfig::default();
        config.join_grace = Duration::from_secs(5);
        let id = round_with_crash(&config, |m| m.hundredths() >= 500);
        let t0 = Instant::now();
        let mut machine = RoundMachine::with_first_round(config, master(), t0, id);

        // Four seconds in, the curve is at 1.42x.
        let at = t0 + Duration::from_secs(11);
        assert!(matches!(
            machine.join_with_auto_cashout(at, profile(1), 10, Some(Multiplier::from_hundredths(120)), None),
            Err(RejectionReason::InvalidAutoCashout { .. })
        ));
        assert!(machine
            .join_with_auto_cashout(at, profile(1), 10, Some(Multiplier::from_hundredths(200)), None)
            .is_ok());
    }

    #[test]
    fn test_join_received_during_previous_round_rejected() {
        let now = Instant::now();
        let mut machine = RoundMachine::new(RoundConfig::default(), master(), now);
        let first = machine.round().id();

        // Crash the first round and let the cooldown create the next one.
        while machine.round().id() == first {
            let deadline = machine.next_deadline();
            machine.advance(deadline);
        }
        assert_eq!(machine.round().phase().kind(), PhaseKind::Waiting);

        // Stamped during the first round's countdown, processed now.
        assert_eq!(
            machine.join(now + Duration::from_secs(1), profile(1), 10, None),
            Err(RejectionReason::InvalidPhase)
        );
        assert!(machine.round().ledger().is_empty());

        let created = machine.round().created_at();
        assert!(machine.join(created, profile(1), 10, None).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_cashout_always_below_crash(seed in 0u32..5_000, offset_ms in 0u64..40_000) {
            let mut bytes = [0u8; 16];
            bytes[..4].copy_from_slice(&seed.to_le_bytes());
            let round_id = RoundId::new(bytes);
            let t0 = Instant::now();
            let config = RoundConfig { cooldown: Duration::from_secs(3_600), ..RoundConfig::default() };
            let curve = config.curve;
            let crash_point = generate_crash_point_with(
                &master().derive_round_secret(&round_id),
                &round_id,
                &config.crash,
            );
            let mut machine = RoundMachine::with_first_round(config, master(), t0, round_id);
            machine.join(t0, profile(1), 100, None).unwrap();

            let started = t0 + Duration::from_secs(7);
            let at = started + Duration::from_millis(offset_ms);
            let result = machine.cashout(at, &PlayerId::new([1; 16]), None);

            let sampled = curve.multiplier_at(Duration::from_millis(offset_ms));

            match result {
                Ok(bet) => {
                    let cashout = bet.cashout.unwrap();
                    prop_assert!(cashout < crash_point);
                    prop_assert_eq!(cashout, sampled);
                }
                Err(reason) => {
                    prop_assert_eq!(reason, RejectionReason::InvalidPhase);
                    prop_assert!(sampled >= crash_point);
                }
            }
        }
    }
}
