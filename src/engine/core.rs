//! Deterministic round state machine.
//!
//! All round state lives here and is only ever touched from the engine task.
//! Time enters as explicit milliseconds, so every transition is reproducible
//! under test without a running clock.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::errors::{Error, Result};
use crate::money::{Money, Multiplier};
use crate::ws::registry::SessionKey;

/// Reference growth curve: `m(t) = 1 + t/3` with `t` in seconds, which in
/// hundredths is exactly `100 + elapsed_ms / 30`.
pub fn multiplier_at(elapsed_ms: u64) -> Multiplier {
    Multiplier::from_x100(100 + elapsed_ms / 30)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Betting,
    Running,
    Crashed,
    /// Oracle or persistence trouble; no wagers accepted.
    Paused,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Betting => "betting",
            Phase::Running => "running",
            Phase::Crashed => "crashed",
            Phase::Paused => "paused",
        }
    }
}

/// The engine's in-memory mirror of the current durable round row.
#[derive(Debug, Clone)]
pub struct LiveRound {
    pub id: i64,
    pub number: i64,
    pub seed_hash: String,
    pub crash: Multiplier,
}

/// One live wager in the current round. Guests carry no store ids.
#[derive(Debug, Clone)]
pub struct LiveWager {
    pub session: SessionKey,
    pub user_id: Option<i64>,
    pub wager_id: Option<i64>,
    pub stake: Money,
    pub auto_cashout: Option<Multiplier>,
    pub cashed_out: Option<Multiplier>,
}

/// Per-session slice of wager state included in engine events.
#[derive(Debug, Clone, Serialize)]
pub struct WagerOverlay {
    pub amount: Money,
    pub cashed_out: Option<Multiplier>,
}

/// An auto-cashout that fired on this tick.
#[derive(Debug, Clone)]
pub struct AutoFire {
    pub session: SessionKey,
    pub threshold: Multiplier,
}

/// Outcome of one RUNNING tick.
#[derive(Debug)]
pub struct TickStep {
    pub multiplier: Multiplier,
    pub fires: Vec<AutoFire>,
    pub crashed: bool,
}

/// Everything a manual cashout needs before the store is touched.
#[derive(Debug, Clone)]
pub struct PendingCashout {
    pub wager_id: Option<i64>,
    pub stake: Money,
    pub multiplier: Multiplier,
}

pub struct EngineCore {
    min_bet: Money,
    max_bet: Money,
    history_len: usize,
    pub phase: Phase,
    pub round: Option<LiveRound>,
    pub countdown_remaining_secs: u64,
    pub multiplier: Multiplier,
    live: HashMap<SessionKey, LiveWager>,
    history: VecDeque<Multiplier>,
    started_at_ms: Option<u64>,
}

impl EngineCore {
    pub fn new(min_bet: Money, max_bet: Money, history_len: usize) -> Self {
        Self {
            min_bet,
            max_bet,
            history_len,
            phase: Phase::Paused,
            round: None,
            countdown_remaining_secs: 0,
            multiplier: Multiplier::ONE,
            live: HashMap::new(),
            history: VecDeque::with_capacity(history_len),
            started_at_ms: None,
        }
    }

    /// Open betting on a freshly committed round; the live-wager set resets.
    pub fn begin_betting(&mut self, round: LiveRound, countdown_secs: u64) {
        self.live.clear();
        self.round = Some(round);
        self.phase = Phase::Betting;
        self.countdown_remaining_secs = countdown_secs;
        self.multiplier = Multiplier::ONE;
        self.started_at_ms = None;
    }

    /// One second of countdown elapsed. Returns true when it hits zero.
    pub fn countdown_step(&mut self) -> bool {
        self.countdown_remaining_secs = self.countdown_remaining_secs.saturating_sub(1);
        self.countdown_remaining_secs == 0
    }

    pub fn begin_running(&mut self, now_ms: u64) {
        self.phase = Phase::Running;
        self.started_at_ms = Some(now_ms);
        self.multiplier = Multiplier::ONE;
    }

    pub fn enter_paused(&mut self) {
        self.phase = Phase::Paused;
        self.round = None;
        self.live.clear();
        self.multiplier = Multiplier::ONE;
    }

    /// Advance the multiplier. Auto-cashouts whose threshold has been reached
    /// fire at exactly their threshold; a threshold at or above the crash
    /// point never fires, so that wager rides into the crash.
    pub fn running_tick(&mut self, now_ms: u64) -> TickStep {
        let crash = self
            .round
            .as_ref()
            .map(|r| r.crash)
            .unwrap_or(Multiplier::ONE);
        let elapsed = now_ms.saturating_sub(self.started_at_ms.unwrap_or(now_ms));
        let raw = multiplier_at(elapsed);
        let crashed = raw >= crash;
        let effective = if crashed { crash } else { raw };
        self.multiplier = effective;

        let fires: Vec<AutoFire> = self
            .live
            .values()
            .filter(|w| w.cashed_out.is_none())
            .filter_map(|w| {
                let threshold = w.auto_cashout?;
                (threshold < crash && threshold <= effective).then(|| AutoFire {
                    session: w.session,
                    threshold,
                })
            })
            .collect();

        TickStep {
            multiplier: effective,
            fires,
            crashed,
        }
    }

    /// Pin the multiplier to the crash point and push it onto the history
    /// ring (newest first, bounded).
    pub fn enter_crashed(&mut self) {
        if let Some(round) = &self.round {
            self.multiplier = round.crash;
            self.history.push_front(round.crash);
            self.history.truncate(self.history_len);
        }
        self.phase = Phase::Crashed;
    }

    /// Admission checks for a bet; the caller performs the debit afterwards.
    pub fn check_bet(&self, session: SessionKey, stake: Money) -> Result<()> {
        if self.phase != Phase::Betting {
            return Err(Error::FailedPrecondition(
                "betting is closed for this round".to_string(),
            ));
        }
        if stake < self.min_bet || stake > self.max_bet {
            return Err(Error::invalid_with(
                "stake out of bounds",
                vec![format!(
                    "stake must be between {} and {}",
                    self.min_bet, self.max_bet
                )],
            ));
        }
        if self.live.contains_key(&session) {
            return Err(Error::AlreadyExists(
                "wager already placed this round".to_string(),
            ));
        }
        Ok(())
    }

    pub fn register_wager(&mut self, wager: LiveWager) {
        self.live.insert(wager.session, wager);
    }

    /// Admission checks for a manual cashout at `now_ms`. The multiplier is
    /// read here, capped at the crash point, so a cashout racing the crash
    /// tick settles at `min(m, crash)` when it wins the mailbox race.
    pub fn prepare_cashout(&self, session: SessionKey, now_ms: u64) -> Result<PendingCashout> {
        if self.phase != Phase::Running {
            return Err(Error::FailedPrecondition(
                "round is not running".to_string(),
            ));
        }
        let wager = self
            .live
            .get(&session)
            .ok_or_else(|| Error::NotFound("no active wager this round".to_string()))?;
        if wager.cashed_out.is_some() {
            return Err(Error::AlreadyExists("wager already cashed out".to_string()));
        }

        let crash = self
            .round
            .as_ref()
            .map(|r| r.crash)
            .unwrap_or(Multiplier::ONE);
        let elapsed = now_ms.saturating_sub(self.started_at_ms.unwrap_or(now_ms));
        let multiplier = multiplier_at(elapsed).min(crash);

        Ok(PendingCashout {
            wager_id: wager.wager_id,
            stake: wager.stake,
            multiplier,
        })
    }

    pub fn mark_cashed(&mut self, session: SessionKey, multiplier: Multiplier) {
        if let Some(wager) = self.live.get_mut(&session) {
            wager.cashed_out = Some(multiplier);
        }
    }

    pub fn live_wager(&self, session: SessionKey) -> Option<&LiveWager> {
        self.live.get(&session)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Recent crash points, newest first.
    pub fn history(&self) -> impl Iterator<Item = Multiplier> + '_ {
        self.history.iter().copied()
    }

    /// Per-session wager overlays for the broadcast fabric.
    pub fn overlays(&self) -> HashMap<SessionKey, WagerOverlay> {
        self.live
            .iter()
            .map(|(key, wager)| {
                (
                    *key,
                    WagerOverlay {
                        amount: wager.stake,
                        cashed_out: wager.cashed_out,
                    },
                )
            })
            .collect()
    }
}
