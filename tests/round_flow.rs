//! End-to-end round flows against a real on-disk store, with the engine's
//! deterministic core driven by a synthetic clock.

use redline::config::DailyLimitsConfig;
use redline::engine::core::{multiplier_at, EngineCore, LiveRound, LiveWager};
use redline::errors::Error;
use redline::fairness::{self, Oracle, RoundPlan};
use redline::money::{Money, Multiplier};
use redline::store::models::{
    LedgerEntryType, Role, Round, RoundStatus, User, WagerStatus,
};
use redline::store::{NewUser, Store};
use redline::ws::registry::SessionKey;

fn open_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("game.db")).unwrap();
    (store, dir)
}

fn seed_user(store: &Store, username: &str, balance: Money) -> User {
    let defaults = DailyLimitsConfig::default();
    store
        .create_user(NewUser {
            username,
            external_id: None,
            role: Role::Player,
            balance,
            password_hash: None,
            daily_defaults: &defaults,
        })
        .unwrap()
}

/// Commit a round with a fixed crash point, bypassing the oracle's RNG so
/// the scenario is fully deterministic.
fn committed_round(store: &Store, crash_x100: u64, nonce: u64) -> Round {
    let seed = format!("{:064x}", nonce + 1);
    let plan = RoundPlan {
        server_seed_hash: fairness::seed_hash(&seed),
        server_seed: seed,
        client_seed: String::new(),
        nonce,
        crash: Multiplier::from_x100(crash_x100),
    };
    store.create_round(&plan).unwrap()
}

fn engine_core() -> EngineCore {
    // min 1.00, max 1000.00, ring of 10: the default game config.
    EngineCore::new(Money::from_minor(100), Money::from_minor(100_000), 10)
}

fn live_round(round: &Round) -> LiveRound {
    LiveRound {
        id: round.id,
        number: round.round_number,
        seed_hash: round.server_seed_hash.clone(),
        crash: round.crash,
    }
}

fn ledger_sum(store: &Store, user_id: i64) -> Money {
    store
        .ledger_for_user(user_id, 1000)
        .unwrap()
        .iter()
        .fold(Money::ZERO, |acc, e| acc + e.signed_amount())
}

/// Scenario 1: balance 1000, bet 100, crash 2.45, manual cashout at t=1.50s.
#[test]
fn happy_path_cashout() {
    let (store, _dir) = open_store();
    let user = seed_user(&store, "alice", Money::from_major(1000));
    let round = committed_round(&store, 245, 1);

    let mut core = engine_core();
    core.begin_betting(live_round(&round), 5);

    let session = SessionKey::User(user.id);
    core.check_bet(session, Money::from_major(100)).unwrap();
    let placed = store
        .place_wager(user.id, round.id, Money::from_major(100), None)
        .unwrap();
    core.register_wager(LiveWager {
        session,
        user_id: Some(user.id),
        wager_id: Some(placed.wager.id),
        stake: Money::from_major(100),
        auto_cashout: None,
        cashed_out: None,
    });
    assert_eq!(placed.balance, Money::from_major(900));

    store
        .update_round_status(round.id, RoundStatus::Running)
        .unwrap();
    core.begin_running(0);

    // Ticks up to 1.45s: still short of the cashout moment.
    for ms in (0..=1450).step_by(50) {
        let step = core.running_tick(ms);
        assert!(!step.crashed);
    }

    // t = 1.50s: the user cashes out at m = 1.50.
    let pending = core.prepare_cashout(session, 1500).unwrap();
    assert_eq!(pending.multiplier, Multiplier::from_x100(150));

    let cashed = store
        .cashout_wager(pending.wager_id.unwrap(), pending.multiplier)
        .unwrap();
    core.mark_cashed(session, pending.multiplier);

    assert_eq!(cashed.wager.status, WagerStatus::CashedOut);
    assert_eq!(cashed.wager.cashout, Some(Multiplier::from_x100(150)));
    assert_eq!(cashed.wager.payout, Some(Money::from_major(150)));
    assert_eq!(cashed.balance, Money::from_major(1050));

    let entries = store.ledger_for_user(user.id, 10).unwrap();
    let types: Vec<_> = entries.iter().map(|e| e.entry_type).collect();
    assert_eq!(types, vec![LedgerEntryType::BetWon, LedgerEntryType::BetPlaced]);
    assert_eq!(entries[0].amount, Money::from_major(150));
    assert_eq!(entries[1].amount, Money::from_major(100));

    // Cashout timestamp falls inside the round's running window.
    let round_row = store.find_round(round.id).unwrap();
    let cashed_at = cashed.wager.cashed_out_at.unwrap();
    assert!(cashed_at >= round_row.started_at.unwrap());
}

/// Scenario 2: crash 1.89, bet 50 with auto-cashout 1.50; fires at the first
/// tick where m >= 1.50 and pays exactly at the threshold.
#[test]
fn auto_cashout_beats_crash() {
    let (store, _dir) = open_store();
    let user = seed_user(&store, "bob", Money::from_major(100));
    let round = committed_round(&store, 189, 1);

    let mut core = engine_core();
    core.begin_betting(live_round(&round), 5);

    let session = SessionKey::User(user.id);
    let placed = store
        .place_wager(
            user.id,
            round.id,
            Money::from_major(50),
            Some(Multiplier::from_x100(150)),
        )
        .unwrap();
    core.register_wager(LiveWager {
        session,
        user_id: Some(user.id),
        wager_id: Some(placed.wager.id),
        stake: Money::from_major(50),
        auto_cashout: Some(Multiplier::from_x100(150)),
        cashed_out: None,
    });

    store
        .update_round_status(round.id, RoundStatus::Running)
        .unwrap();
    core.begin_running(0);

    // Replay the tick schedule; collect the first auto-fire.
    let mut fired_at_ms = None;
    for ms in (0..=3000u64).step_by(50) {
        let step = core.running_tick(ms);
        if let Some(fire) = step.fires.first() {
            assert_eq!(fire.threshold, Multiplier::from_x100(150));
            let cashed = store
                .cashout_wager(placed.wager.id, fire.threshold)
                .unwrap();
            core.mark_cashed(fire.session, fire.threshold);
            fired_at_ms = Some(ms);

            // 50.00 at 1.50x = 75.00; net +25 on the starting 100.
            assert_eq!(cashed.wager.payout, Some(Money::from_minor(7500)));
            assert_eq!(cashed.balance, Money::from_minor(12_500));
            break;
        }
        assert!(!step.crashed, "crashed before auto-cashout fired");
    }

    // First tick at which m(t) = 1 + t/3 >= 1.50 is t = 1.50s.
    assert_eq!(fired_at_ms, Some(1500));
}

/// Scenario 3: crash 1.23, bet 200, no cashout. The wager loses at crash.
#[test]
fn loss_at_crash() {
    let (store, _dir) = open_store();
    let user = seed_user(&store, "carol", Money::from_major(500));
    let round = committed_round(&store, 123, 1);

    let mut core = engine_core();
    core.begin_betting(live_round(&round), 5);
    let placed = store
        .place_wager(user.id, round.id, Money::from_major(200), None)
        .unwrap();
    core.register_wager(LiveWager {
        session: SessionKey::User(user.id),
        user_id: Some(user.id),
        wager_id: Some(placed.wager.id),
        stake: Money::from_major(200),
        auto_cashout: None,
        cashed_out: None,
    });

    store
        .update_round_status(round.id, RoundStatus::Running)
        .unwrap();
    core.begin_running(0);

    // m reaches 1.23 at t = 0.69s; the tick at 700ms crashes the round.
    let mut crashed_at = None;
    for ms in (0..=2000u64).step_by(50) {
        let step = core.running_tick(ms);
        assert!(step.fires.is_empty());
        if step.crashed {
            crashed_at = Some(ms);
            assert_eq!(step.multiplier, Multiplier::from_x100(123));
            break;
        }
    }
    assert_eq!(crashed_at, Some(700));

    core.enter_crashed();
    store
        .update_round_status(round.id, RoundStatus::Crashed)
        .unwrap();
    let settled = store.settle_crashed_round(round.id).unwrap();
    assert_eq!(settled.len(), 1);

    let wager = store.find_wager(placed.wager.id).unwrap();
    assert_eq!(wager.status, WagerStatus::Lost);

    let user_row = store.find_user(user.id).unwrap();
    assert_eq!(user_row.balance, Money::from_major(300));
    assert_eq!(user_row.total_lost, Money::from_major(200));

    let entries = store.ledger_for_user(user.id, 10).unwrap();
    assert_eq!(entries[0].entry_type, LedgerEntryType::BetLost);
}

/// Scenario 4: the second bet in the same betting phase is refused and the
/// balance is untouched by the refusal.
#[test]
fn duplicate_wager_rejected() {
    let (store, _dir) = open_store();
    let user = seed_user(&store, "dave", Money::from_major(100));
    let round = committed_round(&store, 200, 1);

    store
        .place_wager(user.id, round.id, Money::from_major(10), None)
        .unwrap();
    let balance = store.find_user(user.id).unwrap().balance;

    let err = store
        .place_wager(user.id, round.id, Money::from_major(10), None)
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    assert_eq!(store.find_user(user.id).unwrap().balance, balance);
}

/// Scenario 5: a bet beyond the balance fails atomically.
#[test]
fn insufficient_funds_is_side_effect_free() {
    let (store, _dir) = open_store();
    let user = seed_user(&store, "erin", Money::from_minor(5000));
    let round = committed_round(&store, 200, 1);

    let err = store
        .place_wager(user.id, round.id, Money::from_major(100), None)
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds));

    assert_eq!(
        store.find_user(user.id).unwrap().balance,
        Money::from_minor(5000)
    );
    assert!(store.ledger_for_user(user.id, 10).unwrap().is_empty());
    assert!(store
        .find_active_wager(user.id, round.id)
        .unwrap()
        .is_none());
}

/// Scenario 6: an external verifier reproduces the crash point from the
/// revealed seed material.
#[test]
fn verifier_reproduces_crash_point() {
    let (store, _dir) = open_store();
    let oracle = Oracle::new("shared-client-seed".to_string(), 100).unwrap();

    let plan = oracle.next_round(1).unwrap();
    let round = store.create_round(&plan).unwrap();
    store
        .update_round_status(round.id, RoundStatus::Running)
        .unwrap();
    store
        .update_round_status(round.id, RoundStatus::Crashed)
        .unwrap();

    // Inside the grace window: hash public, seed withheld.
    let concealed = &store.recent_fair_rounds(10, 300).unwrap()[0];
    assert!(concealed.server_seed.is_none());
    assert_eq!(concealed.server_seed_hash, plan.server_seed_hash);

    // After the grace window the seed appears and the derivation checks out.
    let revealed = &store.recent_fair_rounds(10, 0).unwrap()[0];
    let seed = revealed.server_seed.as_ref().unwrap();
    assert!(fairness::verify_round(
        seed,
        &revealed.server_seed_hash,
        &revealed.client_seed,
        revealed.nonce as u64,
        100,
        revealed.crash_point,
    )
    .unwrap());
}

/// I1 across a mixed history: the balance always equals the signed ledger
/// sum, and never goes negative.
#[test]
fn ledger_invariant_across_rounds() {
    let (store, _dir) = open_store();
    let user = seed_user(&store, "frank", Money::from_major(100));

    for (nonce, crash_x100, cashout) in [(1, 150, Some(120)), (2, 300, None), (3, 110, Some(105))]
    {
        let round = committed_round(&store, crash_x100, nonce);
        let placed = store
            .place_wager(user.id, round.id, Money::from_major(10), None)
            .unwrap();
        store
            .update_round_status(round.id, RoundStatus::Running)
            .unwrap();
        if let Some(at) = cashout {
            store
                .cashout_wager(placed.wager.id, Multiplier::from_x100(at))
                .unwrap();
        }
        store
            .update_round_status(round.id, RoundStatus::Crashed)
            .unwrap();
        store.settle_crashed_round(round.id).unwrap();

        let balance = store.find_user(user.id).unwrap().balance;
        assert_eq!(balance, Money::from_major(100) + ledger_sum(&store, user.id));
        assert!(!balance.is_negative());
    }

    // Aggregate bookkeeping: profit definition is won minus lost.
    let user_row = store.find_user(user.id).unwrap();
    assert_eq!(
        user_row.net_profit(),
        user_row.total_won - user_row.total_lost
    );
    assert_eq!(user_row.games_played, 3);
}

/// I5: round numbers increase strictly and only one round is ever live.
#[test]
fn rounds_are_serialized_and_monotonic() {
    let (store, _dir) = open_store();

    let mut last_number = 0;
    for nonce in 1..=5 {
        let round = committed_round(&store, 150, nonce);
        assert!(round.round_number > last_number);
        last_number = round.round_number;

        assert!(matches!(
            store
                .create_round(&RoundPlan {
                    server_seed: "00".repeat(32),
                    server_seed_hash: fairness::seed_hash(&"00".repeat(32)),
                    client_seed: String::new(),
                    nonce: 999,
                    crash: Multiplier::from_x100(150),
                })
                .unwrap_err(),
            Error::FailedPrecondition(_)
        ));

        store
            .update_round_status(round.id, RoundStatus::Running)
            .unwrap();
        store
            .update_round_status(round.id, RoundStatus::Crashed)
            .unwrap();
    }
}

/// Boundary: bets at exactly the configured bounds pass, one minor unit
/// outside fails.
#[test]
fn bet_bounds_are_inclusive() {
    let core = {
        let mut c = engine_core();
        let (store, _dir) = open_store();
        let round = committed_round(&store, 150, 1);
        c.begin_betting(live_round(&round), 5);
        c
    };

    let fresh = || SessionKey::Guest(uuid::Uuid::new_v4());
    assert!(core.check_bet(fresh(), Money::from_minor(100)).is_ok());
    assert!(core.check_bet(fresh(), Money::from_minor(100_000)).is_ok());
    assert!(core.check_bet(fresh(), Money::from_minor(99)).is_err());
    assert!(core.check_bet(fresh(), Money::from_minor(100_001)).is_err());
}

/// The documented growth curve hits its reference points on the tick grid.
#[test]
fn growth_curve_matches_documentation() {
    assert_eq!(multiplier_at(0).x100(), 100);
    assert_eq!(multiplier_at(1500).x100(), 150);
    assert_eq!(multiplier_at(3000).x100(), 200);
    assert_eq!(multiplier_at(4350).x100(), 245);
}
