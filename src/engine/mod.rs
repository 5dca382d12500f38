//! Round engine and wager arbiter
//!
//! One task owns the authoritative round state and drives the phase machine
//! on a fixed tick schedule. Bet and cashout requests arrive as messages on
//! a bounded mailbox, so admission is serialized without locks; persistence
//! runs off-task via `spawn_blocking` and never holds up a tick for another
//! caller more than one command at a time.
//!
//! Phase cycle: BETTING -> RUNNING -> CRASHED -> (pause) -> BETTING, with a
//! PAUSED detour on oracle or persistence failure.

pub mod core;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::RedlineConfig;
use crate::errors::{Error, Result};
use crate::fairness::Oracle;
use crate::money::{Money, Multiplier};
use crate::store::models::RoundStatus;
use crate::store::Store;
use crate::ws::frames::{PublicFrame, ServerMessage};
use crate::ws::registry::{SessionKey, SessionRegistry};

use self::core::{EngineCore, LiveRound, LiveWager, Phase, WagerOverlay};

const SETTLE_ATTEMPTS: u32 = 3;
const PAUSE_BACKOFF_MAX_SECS: u64 = 30;

/// Acknowledgement for a placed bet.
#[derive(Debug, Clone)]
pub struct BetAck {
    pub stake: Money,
    pub balance: Money,
}

/// Acknowledgement for a cashout (manual or auto).
#[derive(Debug, Clone)]
pub struct CashoutAck {
    pub multiplier: Multiplier,
    pub payout: Money,
    pub balance: Money,
}

/// Arbiter requests, serialized through the engine mailbox.
pub enum Command {
    PlaceBet {
        session: SessionKey,
        user_id: Option<i64>,
        stake: Money,
        auto_cashout: Option<Multiplier>,
        reply: oneshot::Sender<Result<BetAck>>,
    },
    CashOut {
        session: SessionKey,
        reply: oneshot::Sender<Result<CashoutAck>>,
    },
    Shutdown,
}

/// Events fanned out to every connected session.
#[derive(Clone)]
pub enum EngineEvent {
    /// A public frame, serialized once, plus per-session wager overlays.
    State {
        public_json: Arc<str>,
        overlays: Arc<HashMap<SessionKey, WagerOverlay>>,
        /// Terminal frames (betting open, crash) must not be dropped by
        /// slow consumers.
        terminal: bool,
    },
    /// An auto-cashout fired for this session.
    AutoCashout {
        session: SessionKey,
        ack: CashoutAck,
    },
}

/// Cheap handle for submitting actions and subscribing to events.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
    latest: watch::Receiver<Arc<str>>,
}

impl EngineHandle {
    pub async fn place_bet(
        &self,
        session: SessionKey,
        user_id: Option<i64>,
        stake: Money,
        auto_cashout: Option<Multiplier>,
    ) -> Result<BetAck> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::PlaceBet {
            session,
            user_id,
            stake,
            auto_cashout,
            reply,
        })?;
        rx.await
            .map_err(|_| Error::internal("engine dropped the request"))?
    }

    pub async fn cash_out(&self, session: SessionKey) -> Result<CashoutAck> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::CashOut { session, reply })?;
        rx.await
            .map_err(|_| Error::internal("engine dropped the request"))?
    }

    /// Begin draining: the current round runs to CRASHED, then the engine
    /// task exits.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Latest public frame, for resyncing a lagged consumer.
    pub fn latest_frame(&self) -> Arc<str> {
        self.latest.borrow().clone()
    }

    /// A full mailbox drops the action rather than stalling the engine.
    fn submit(&self, command: Command) -> Result<()> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::ResourceExhausted {
                retry_after_secs: 1,
            },
            mpsc::error::TrySendError::Closed(_) => Error::internal("engine stopped"),
        })
    }
}

/// The single authoritative driver of the game state machine.
pub struct RoundEngine {
    store: Arc<Store>,
    oracle: Oracle,
    registry: Arc<SessionRegistry>,
    countdown_secs: u64,
    tick_ms: u64,
    post_crash_pause: Duration,
    core: EngineCore,
    rx: mpsc::Receiver<Command>,
    events: broadcast::Sender<EngineEvent>,
    latest_tx: watch::Sender<Arc<str>>,
    clock_start: Instant,
    next_nonce: u64,
    draining: bool,
}

impl RoundEngine {
    /// Wire up channels and spawn the engine task. The join handle resolves
    /// once a drain (see [`EngineHandle::shutdown`]) completes.
    pub fn spawn(
        store: Arc<Store>,
        oracle: Oracle,
        registry: Arc<SessionRegistry>,
        config: &RedlineConfig,
    ) -> Result<(EngineHandle, tokio::task::JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(config.limits.engine_mailbox);
        let (events, _) = broadcast::channel(256);
        let (latest_tx, latest) = watch::channel::<Arc<str>>(Arc::from(""));

        let next_nonce = store.last_round_number()? as u64 + 1;

        let engine = RoundEngine {
            store,
            oracle,
            registry,
            countdown_secs: config.game.countdown_secs,
            tick_ms: config.game.tick_ms.max(10),
            post_crash_pause: Duration::from_secs(config.game.post_crash_pause_secs),
            core: EngineCore::new(
                config.game.min_bet_money(),
                config.game.max_bet_money(),
                config.game.history_len,
            ),
            rx,
            events: events.clone(),
            latest_tx,
            clock_start: Instant::now(),
            next_nonce,
            draining: false,
        };

        let handle = EngineHandle { tx, events, latest };
        let join = tokio::spawn(engine.run());
        Ok((handle, join))
    }

    async fn run(mut self) {
        info!(next_round = self.next_nonce, "round engine starting");
        let mut backoff_secs = 1u64;

        loop {
            // ---- commit the next round ----
            let round = match self.open_round().await {
                Ok(round) => {
                    backoff_secs = 1;
                    round
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs, "cannot open round, pausing");
                    self.paused_wait(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(PAUSE_BACKOFF_MAX_SECS);
                    if self.draining {
                        break;
                    }
                    continue;
                }
            };
            let round_id = round.id;
            info!(round = round.number, "betting open");
            self.core.begin_betting(round, self.countdown_secs);
            self.broadcast_state(true);

            // ---- betting countdown, one broadcast per second ----
            let mut next_second = Instant::now() + Duration::from_secs(1);
            loop {
                tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(next_second) => {
                        next_second += Duration::from_secs(1);
                        let done = self.core.countdown_step();
                        self.broadcast_state(false);
                        if done {
                            break;
                        }
                    }
                    cmd = self.rx.recv() => match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => return,
                    },
                }
            }

            // ---- running ----
            let started = self
                .run_blocking(move |store| store.update_round_status(round_id, RoundStatus::Running))
                .await;
            match started {
                Ok(_) => {
                    self.core.begin_running(self.now_ms());
                    info!(round = self.round_number(), "running");
                    self.run_ticks().await;
                }
                Err(e) => {
                    // Persistence failure at state entry is fatal for the
                    // round: settle against the committed crash point.
                    error!(error = %e, round = self.round_number(), "failed to start round, crashing it");
                }
            }

            // ---- crashed ----
            self.core.enter_crashed();
            info!(
                round = self.round_number(),
                crash = %self.core.multiplier,
                "crashed"
            );
            self.settle_round(round_id).await;
            self.broadcast_state(true);

            self.post_crash_wait().await;

            if self.draining {
                break;
            }
        }

        info!("round engine drained, stopping");
    }

    /// Ask the oracle for committed material and create the durable row.
    async fn open_round(&mut self) -> Result<LiveRound> {
        let plan = self.oracle.next_round(self.next_nonce)?;
        let row = self
            .run_blocking({
                let plan = plan.clone();
                move |store| store.create_round(&plan)
            })
            .await?;
        self.next_nonce = row.round_number as u64 + 1;
        Ok(LiveRound {
            id: row.id,
            number: row.round_number,
            seed_hash: row.server_seed_hash,
            crash: plan.crash,
        })
    }

    /// RUNNING loop: advance the multiplier every tick, fire auto-cashouts,
    /// and exit once the crash point is reached.
    async fn run_ticks(&mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.tick_ms));
        loop {
            tokio::select! {
                biased;
                _ = tick.tick() => {
                    let step = self.core.running_tick(self.now_ms());
                    for fire in step.fires {
                        self.auto_cashout(fire.session, fire.threshold).await;
                    }
                    if step.crashed {
                        return;
                    }
                    self.broadcast_state(false);
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => return,
                },
            }
        }
    }

    /// Serve (and mostly refuse) commands while paused for `wait`.
    async fn paused_wait(&mut self, wait: Duration) {
        self.core.enter_paused();
        self.broadcast_state(true);
        let deadline = Instant::now() + wait;
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => return,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => return,
                },
            }
        }
    }

    /// Keep serving the mailbox during the post-crash pause so bet attempts
    /// get phase errors instead of silence.
    async fn post_crash_wait(&mut self) {
        let deadline = Instant::now() + self.post_crash_pause;
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => return,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => return,
                },
            }
        }
    }

    /// Durable settlement with bounded retries. Exhausted retries degrade to
    /// an operator alert; clients are never shown settlement failures.
    async fn settle_round(&mut self, round_id: i64) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let settled = self
                .run_blocking(move |store| {
                    let lost = store.settle_crashed_round(round_id)?;
                    store.update_round_status(round_id, RoundStatus::Crashed)?;
                    Ok(lost)
                })
                .await;
            match settled {
                Ok(lost) => {
                    if !lost.is_empty() {
                        info!(round_id, losses = lost.len(), "round settled");
                    }
                    return;
                }
                Err(e) if attempt < SETTLE_ATTEMPTS => {
                    warn!(error = %e, attempt, "settlement failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        round_id,
                        "settlement failed after {} attempts; consistency degraded, \
                         administrative reconciliation required",
                        SETTLE_ATTEMPTS
                    );
                    return;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::PlaceBet {
                session,
                user_id,
                stake,
                auto_cashout,
                reply,
            } => {
                let result = self.place_bet(session, user_id, stake, auto_cashout).await;
                let _ = reply.send(result);
            }
            Command::CashOut { session, reply } => {
                let result = self.cash_out(session).await;
                let _ = reply.send(result);
            }
            Command::Shutdown => {
                info!("shutdown requested, draining current round");
                self.draining = true;
            }
        }
    }

    /// Admission and execution of one bet. Authenticated stakes go through
    /// the persistence gateway; guests debit their session-local balance and
    /// never touch the store.
    async fn place_bet(
        &mut self,
        session: SessionKey,
        user_id: Option<i64>,
        stake: Money,
        auto_cashout: Option<Multiplier>,
    ) -> Result<BetAck> {
        if self.draining {
            return Err(Error::FailedPrecondition(
                "server is shutting down".to_string(),
            ));
        }
        self.core.check_bet(session, stake)?;

        let round_id = self
            .core
            .round
            .as_ref()
            .map(|r| r.id)
            .ok_or_else(|| Error::FailedPrecondition("no live round".to_string()))?;

        let (wager_id, balance) = match user_id {
            Some(uid) => {
                let placed = self
                    .run_blocking(move |store| store.place_wager(uid, round_id, stake, auto_cashout))
                    .await?;
                self.registry.set_balance(session, placed.balance);
                (Some(placed.wager.id), placed.balance)
            }
            None => {
                let balance = self.registry.debit_guest(session, stake)?;
                (None, balance)
            }
        };

        self.core.register_wager(LiveWager {
            session,
            user_id,
            wager_id,
            stake,
            auto_cashout,
            cashed_out: None,
        });

        Ok(BetAck { stake, balance })
    }

    async fn cash_out(&mut self, session: SessionKey) -> Result<CashoutAck> {
        let pending = self.core.prepare_cashout(session, self.now_ms())?;
        let multiplier = pending.multiplier;

        let ack = match pending.wager_id {
            Some(wager_id) => {
                let placed = self
                    .run_blocking(move |store| store.cashout_wager(wager_id, multiplier))
                    .await?;
                self.registry.set_balance(session, placed.balance);
                CashoutAck {
                    multiplier,
                    payout: placed.wager.payout.unwrap_or(Money::ZERO),
                    balance: placed.balance,
                }
            }
            None => {
                let payout = pending.stake.payout_at(multiplier);
                let balance = self.registry.credit_guest(session, payout)?;
                CashoutAck {
                    multiplier,
                    payout,
                    balance,
                }
            }
        };

        self.core.mark_cashed(session, multiplier);
        Ok(ack)
    }

    /// Cash a wager out on the user's behalf at its threshold multiplier.
    async fn auto_cashout(&mut self, session: SessionKey, threshold: Multiplier) {
        let Some(wager) = self.core.live_wager(session).cloned() else {
            return;
        };
        if wager.cashed_out.is_some() {
            return;
        }

        let outcome: Result<CashoutAck> = match wager.wager_id {
            Some(wager_id) => {
                let result = self
                    .run_blocking(move |store| store.cashout_wager(wager_id, threshold))
                    .await;
                result.map(|placed| {
                    self.registry.set_balance(session, placed.balance);
                    CashoutAck {
                        multiplier: threshold,
                        payout: placed.wager.payout.unwrap_or(Money::ZERO),
                        balance: placed.balance,
                    }
                })
            }
            None => {
                let payout = wager.stake.payout_at(threshold);
                self.registry
                    .credit_guest(session, payout)
                    .map(|balance| CashoutAck {
                        multiplier: threshold,
                        payout,
                        balance,
                    })
            }
        };

        match outcome {
            Ok(ack) => {
                self.core.mark_cashed(session, threshold);
                let _ = self.events.send(EngineEvent::AutoCashout { session, ack });
            }
            Err(e) => {
                // Left live: the next tick retries until the round crashes.
                warn!(error = %e, ?session, "auto-cashout failed");
            }
        }
    }

    /// Compose the public frame, serialize it once, and fan it out together
    /// with the per-session overlays.
    fn broadcast_state(&mut self, terminal: bool) {
        let round = self.core.round.as_ref();
        let frame = PublicFrame {
            phase: self.core.phase.as_str(),
            round_number: round.map(|r| r.number),
            multiplier: self.core.multiplier.to_f64(),
            countdown: (self.core.phase == Phase::Betting)
                .then_some(self.core.countdown_remaining_secs),
            players: self.registry.count(),
            history: self.core.history().map(|m| m.to_f64()).collect(),
            server_seed_hash: round.map(|r| r.seed_hash.clone()),
            maintenance: self.core.phase == Phase::Paused,
        };

        let message = ServerMessage::GameState { frame };
        let json: Arc<str> = match serde_json::to_string(&message) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!(error = %e, "failed to serialize public frame");
                return;
            }
        };

        let _ = self.latest_tx.send(json.clone());
        let _ = self.events.send(EngineEvent::State {
            public_json: json,
            overlays: Arc::new(self.core.overlays()),
            terminal,
        });
    }

    /// Run a persistence call off the engine's scheduling unit, bounded by
    /// the per-call deadline.
    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || f(&store));
        match tokio::time::timeout(crate::api::STORE_DEADLINE, task).await {
            Err(_) => Err(Error::DeadlineExceeded),
            Ok(join) => {
                join.map_err(|e| Error::internal(format!("persistence task panicked: {}", e)))?
            }
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock_start.elapsed().as_millis() as u64
    }

    fn round_number(&self) -> i64 {
        self.core.round.as_ref().map(|r| r.number).unwrap_or(0)
    }
}
