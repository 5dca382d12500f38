//! The atomic wager lifecycle: place, cash out, settle.
//!
//! Each operation here is one transaction. A placed wager either lives with
//! its debit, ledger row, and daily counters all written, or never existed.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::errors::{Error, Result};
use crate::money::{Money, Multiplier};

use super::models::{LedgerEntryType, RoundStatus, Wager, WagerStatus};
use super::users::apply_balance_delta;
use super::{day_key, format_ts, Store};

/// Result of a successful placement.
#[derive(Debug, Clone)]
pub struct PlacedWager {
    pub wager: Wager,
    pub balance: Money,
}

/// One wager marked LOST during settlement.
#[derive(Debug, Clone)]
pub struct SettledWager {
    pub wager_id: i64,
    pub user_id: i64,
    pub stake: Money,
}

impl Store {
    /// Place a wager: phase check, daily limits, debit, wager row, ledger
    /// row, counters, all in one transaction.
    pub fn place_wager(
        &self,
        user_id: i64,
        round_id: i64,
        stake: Money,
        auto_cashout: Option<Multiplier>,
    ) -> Result<PlacedWager> {
        if !stake.is_positive() {
            return Err(Error::invalid("stake must be positive"));
        }

        self.with_tx(|tx| {
            let round_status: Option<String> = tx
                .query_row(
                    "SELECT status FROM rounds WHERE id = ?1",
                    params![round_id],
                    |row| row.get(0),
                )
                .optional()?;
            match round_status.as_deref().and_then(RoundStatus::parse) {
                Some(RoundStatus::Betting) => {}
                Some(_) => {
                    return Err(Error::FailedPrecondition(
                        "round is not accepting bets".to_string(),
                    ))
                }
                None => return Err(Error::NotFound(format!("round {}", round_id))),
            }

            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM wagers WHERE user_id = ?1 AND round_id = ?2",
                params![user_id, round_id],
                |row| row.get(0),
            )?;
            if existing > 0 {
                return Err(Error::AlreadyExists(
                    "wager already placed this round".to_string(),
                ));
            }

            check_daily_limits(tx, user_id, stake)?;

            let now = Utc::now();
            tx.execute(
                "INSERT INTO wagers
                     (user_id, round_id, stake, auto_cashout_x100, placed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id,
                    round_id,
                    stake.minor(),
                    auto_cashout.map(|m| m.x100() as i64),
                    format_ts(now),
                ],
            )?;
            let wager_id = tx.last_insert_rowid();

            // A failed debit rolls the wager row back with it.
            let (_, balance) = apply_balance_delta(
                tx,
                user_id,
                -stake,
                LedgerEntryType::BetPlaced,
                "wager placed",
                Some(wager_id),
            )?;

            let xp_gain = stake.minor() / 100;
            tx.execute(
                "UPDATE users
                 SET total_wagered = total_wagered + ?1,
                     games_played = games_played + 1,
                     xp = xp + ?2,
                     level = (xp + ?2) / 1000 + 1
                 WHERE id = ?3",
                params![stake.minor(), xp_gain, user_id],
            )?;

            tx.execute(
                "INSERT INTO daily_limits (user_id, day, wagered, games)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT (user_id, day)
                 DO UPDATE SET wagered = wagered + ?3, games = games + 1",
                params![user_id, day_key(now), stake.minor()],
            )?;

            Ok(PlacedWager {
                wager: get_wager(tx, wager_id)?,
                balance,
            })
        })
    }

    /// Cash out an ACTIVE wager at `multiplier`: credit the payout, mark the
    /// wager, bump aggregates, one transaction.
    pub fn cashout_wager(&self, wager_id: i64, multiplier: Multiplier) -> Result<PlacedWager> {
        self.with_tx(|tx| {
            let wager = get_wager(tx, wager_id)?;
            if wager.status != WagerStatus::Active {
                return Err(Error::FailedPrecondition(format!(
                    "wager is {}",
                    wager.status.as_str()
                )));
            }

            let round_status: String = tx.query_row(
                "SELECT status FROM rounds WHERE id = ?1",
                params![wager.round_id],
                |row| row.get(0),
            )?;
            if RoundStatus::parse(&round_status) != Some(RoundStatus::Running) {
                return Err(Error::FailedPrecondition(
                    "round is not running".to_string(),
                ));
            }

            let payout = wager.stake.payout_at(multiplier);
            let (_, balance) = apply_balance_delta(
                tx,
                wager.user_id,
                payout,
                LedgerEntryType::BetWon,
                &format!("cashed out at {}", multiplier),
                Some(wager_id),
            )?;

            let now = Utc::now();
            tx.execute(
                "UPDATE wagers
                 SET status = 'CASHED_OUT', cashout_x100 = ?1, payout = ?2, cashed_out_at = ?3
                 WHERE id = ?4",
                params![
                    multiplier.x100() as i64,
                    payout.minor(),
                    format_ts(now),
                    wager_id,
                ],
            )?;

            let net_win = payout - wager.stake;
            tx.execute(
                "UPDATE users
                 SET total_won = total_won + ?1,
                     biggest_win = MAX(biggest_win, ?2)
                 WHERE id = ?3",
                params![payout.minor(), net_win.minor(), wager.user_id],
            )?;

            Ok(PlacedWager {
                wager: get_wager(tx, wager_id)?,
                balance,
            })
        })
    }

    /// Mark every still-ACTIVE wager of a crashed round LOST. Losses were
    /// debited at placement, so no balance moves here, only ledger records,
    /// aggregates, and daily loss counters.
    pub fn settle_crashed_round(&self, round_id: i64) -> Result<Vec<SettledWager>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, user_id, stake FROM wagers
                 WHERE round_id = ?1 AND status = 'ACTIVE'",
            )?;
            let active: Vec<(i64, i64, i64)> = stmt
                .query_map(params![round_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);

            let now = Utc::now();
            let day = day_key(now);
            let mut settled = Vec::with_capacity(active.len());

            for (wager_id, user_id, stake_minor) in active {
                let stake = Money::from_minor(stake_minor);

                tx.execute(
                    "UPDATE wagers SET status = 'LOST' WHERE id = ?1",
                    params![wager_id],
                )?;

                // Balance unchanged at loss; record the outcome in the ledger.
                let balance: i64 = tx.query_row(
                    "SELECT balance FROM users WHERE id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO ledger
                         (user_id, wager_id, entry_type, amount, balance_before,
                          balance_after, description, created_at)
                     VALUES (?1, ?2, 'BET_LOST', ?3, ?4, ?4, 'round crashed', ?5)",
                    params![user_id, wager_id, stake.minor(), balance, format_ts(now)],
                )?;

                tx.execute(
                    "UPDATE users
                     SET total_lost = total_lost + ?1,
                         biggest_loss = MAX(biggest_loss, ?1)
                     WHERE id = ?2",
                    params![stake.minor(), user_id],
                )?;

                tx.execute(
                    "INSERT INTO daily_limits (user_id, day, lost)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (user_id, day)
                     DO UPDATE SET lost = lost + ?3",
                    params![user_id, day, stake.minor()],
                )?;

                settled.push(SettledWager {
                    wager_id,
                    user_id,
                    stake,
                });
            }

            Ok(settled)
        })
    }

    pub fn find_wager(&self, wager_id: i64) -> Result<Wager> {
        self.with_conn(|conn| get_wager(conn, wager_id))
    }

    /// The user's ACTIVE wager in a round, if any. Used to re-associate a
    /// reconnecting session with its live wager.
    pub fn find_active_wager(&self, user_id: i64, round_id: i64) -> Result<Option<Wager>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "{} WHERE user_id = ?1 AND round_id = ?2 AND status = 'ACTIVE'",
                    SELECT_WAGER
                ),
                params![user_id, round_id],
                row_to_wager,
            )
            .optional()
            .map_err(Into::into)
        })
    }
}

/// Reject placement when the user's enabled daily limits would be crossed.
fn check_daily_limits(tx: &Transaction<'_>, user_id: i64, stake: Money) -> Result<()> {
    let enabled: bool = tx
        .query_row(
            "SELECT daily_limits_enabled FROM player_settings WHERE user_id = ?1",
            params![user_id],
            |row| row.get::<_, i64>(0).map(|v| v != 0),
        )
        .optional()?
        .unwrap_or(false);
    if !enabled {
        return Ok(());
    }

    let (max_wager, max_loss, max_games): (i64, i64, i64) = tx.query_row(
        "SELECT max_daily_wager, max_daily_loss, max_games_per_day
         FROM player_settings WHERE user_id = ?1",
        params![user_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let (wagered, lost, games): (i64, i64, i64) = tx
        .query_row(
            "SELECT wagered, lost, games FROM daily_limits WHERE user_id = ?1 AND day = ?2",
            params![user_id, day_key(Utc::now())],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .unwrap_or((0, 0, 0));

    if wagered + stake.minor() > max_wager {
        return Err(Error::DailyLimitExceeded(
            "daily wager limit reached".to_string(),
        ));
    }
    if lost >= max_loss {
        return Err(Error::DailyLimitExceeded(
            "daily loss limit reached".to_string(),
        ));
    }
    if games + 1 > max_games {
        return Err(Error::DailyLimitExceeded(
            "daily games limit reached".to_string(),
        ));
    }
    Ok(())
}

const SELECT_WAGER: &str = "SELECT id, user_id, round_id, stake, auto_cashout_x100, cashout_x100,
            payout, status, placed_at, cashed_out_at
     FROM wagers";

pub(super) fn get_wager(conn: &Connection, id: i64) -> Result<Wager> {
    conn.query_row(
        &format!("{} WHERE id = ?1", SELECT_WAGER),
        params![id],
        row_to_wager,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("wager {}", id)))
}

fn row_to_wager(row: &rusqlite::Row<'_>) -> rusqlite::Result<Wager> {
    let status_str: String = row.get(7)?;
    let status = WagerStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown wager status '{}'", status_str).into(),
        )
    })?;

    Ok(Wager {
        id: row.get(0)?,
        user_id: row.get(1)?,
        round_id: row.get(2)?,
        stake: Money::from_minor(row.get(3)?),
        auto_cashout: row
            .get::<_, Option<i64>>(4)?
            .map(|v| Multiplier::from_x100(v as u64)),
        cashout: row
            .get::<_, Option<i64>>(5)?
            .map(|v| Multiplier::from_x100(v as u64)),
        payout: row.get::<_, Option<i64>>(6)?.map(Money::from_minor),
        status,
        placed_at: super::parse_ts(8, &row.get::<_, String>(8)?)?,
        cashed_out_at: super::parse_opt_ts(9, row.get(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fairness::RoundPlan;
    use crate::store::models::{Round, User};
    use crate::store::test_support::{new_store, seed_user};
    use crate::store::SettingsPatch;

    fn seed_round(store: &Store, crash_x100: u64) -> Round {
        let seed = "cd".repeat(32);
        let plan = RoundPlan {
            server_seed_hash: crate::fairness::seed_hash(&seed),
            server_seed: seed,
            client_seed: String::new(),
            nonce: 1,
            crash: Multiplier::from_x100(crash_x100),
        };
        store.create_round(&plan).unwrap()
    }

    fn open_running(store: &Store, round: &Round) {
        store
            .update_round_status(round.id, RoundStatus::Running)
            .unwrap();
    }

    fn place(store: &Store, user: &User, round: &Round, stake_minor: i64) -> PlacedWager {
        store
            .place_wager(
                user.id,
                round.id,
                Money::from_minor(stake_minor),
                None,
            )
            .unwrap()
    }

    #[test]
    fn happy_path_cashout() {
        let store = new_store();
        let user = seed_user(&store, "alice", Money::from_major(1000));
        let round = seed_round(&store, 245);

        let placed = place(&store, &user, &round, 10_000); // 100.00
        assert_eq!(placed.balance, Money::from_major(900));
        assert_eq!(placed.wager.status, WagerStatus::Active);

        open_running(&store, &round);

        let cashed = store
            .cashout_wager(placed.wager.id, Multiplier::from_x100(150))
            .unwrap();
        assert_eq!(cashed.wager.status, WagerStatus::CashedOut);
        assert_eq!(cashed.wager.cashout, Some(Multiplier::from_x100(150)));
        assert_eq!(cashed.wager.payout, Some(Money::from_major(150)));
        assert_eq!(cashed.balance, Money::from_major(1050));

        let entries = store.ledger_for_user(user.id, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_type, LedgerEntryType::BetWon);
        assert_eq!(entries[0].amount, Money::from_major(150));
        assert_eq!(entries[1].entry_type, LedgerEntryType::BetPlaced);
        assert_eq!(entries[1].amount, Money::from_major(100));
        assert_eq!(entries[1].wager_id, Some(placed.wager.id));
    }

    #[test]
    fn duplicate_wager_rejected_without_side_effects() {
        let store = new_store();
        let user = seed_user(&store, "bob", Money::from_major(100));
        let round = seed_round(&store, 150);

        place(&store, &user, &round, 1000);
        let balance_after_first = store.find_user(user.id).unwrap().balance;

        let err = store
            .place_wager(user.id, round.id, Money::from_minor(1000), None)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(store.find_user(user.id).unwrap().balance, balance_after_first);
    }

    #[test]
    fn insufficient_funds_leaves_no_wager_row() {
        let store = new_store();
        let user = seed_user(&store, "carol", Money::from_minor(5000)); // 50.00
        let round = seed_round(&store, 150);

        let err = store
            .place_wager(user.id, round.id, Money::from_major(100), None)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds));

        assert_eq!(store.find_user(user.id).unwrap().balance, Money::from_minor(5000));
        assert!(store
            .find_active_wager(user.id, round.id)
            .unwrap()
            .is_none());
        assert!(store.ledger_for_user(user.id, 10).unwrap().is_empty());
    }

    #[test]
    fn betting_phase_required() {
        let store = new_store();
        let user = seed_user(&store, "dave", Money::from_major(100));
        let round = seed_round(&store, 150);
        open_running(&store, &round);

        let err = store
            .place_wager(user.id, round.id, Money::from_major(10), None)
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
    }

    #[test]
    fn cashout_requires_running_round_and_active_wager() {
        let store = new_store();
        let user = seed_user(&store, "erin", Money::from_major(100));
        let round = seed_round(&store, 150);
        let placed = place(&store, &user, &round, 1000);

        // Still betting.
        let err = store
            .cashout_wager(placed.wager.id, Multiplier::from_x100(120))
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));

        open_running(&store, &round);
        store
            .cashout_wager(placed.wager.id, Multiplier::from_x100(120))
            .unwrap();

        // Second cashout refused, balance untouched.
        let balance = store.find_user(user.id).unwrap().balance;
        let err = store
            .cashout_wager(placed.wager.id, Multiplier::from_x100(130))
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
        assert_eq!(store.find_user(user.id).unwrap().balance, balance);
    }

    #[test]
    fn settlement_marks_losses_once() {
        let store = new_store();
        let user = seed_user(&store, "frank", Money::from_major(500));
        let round = seed_round(&store, 123);

        let placed = place(&store, &user, &round, 20_000); // 200.00
        open_running(&store, &round);
        store
            .update_round_status(round.id, RoundStatus::Crashed)
            .unwrap();

        let settled = store.settle_crashed_round(round.id).unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].user_id, user.id);
        assert_eq!(settled[0].stake, Money::from_major(200));

        let wager = store.find_wager(placed.wager.id).unwrap();
        assert_eq!(wager.status, WagerStatus::Lost);
        assert!(wager.payout.is_none());

        let user_row = store.find_user(user.id).unwrap();
        assert_eq!(user_row.balance, Money::from_major(300));
        assert_eq!(user_row.total_lost, Money::from_major(200));

        let entries = store.ledger_for_user(user.id, 10).unwrap();
        assert_eq!(entries[0].entry_type, LedgerEntryType::BetLost);
        assert_eq!(entries[0].signed_amount(), Money::ZERO);

        // Settlement is idempotent: nothing left ACTIVE.
        assert!(store.settle_crashed_round(round.id).unwrap().is_empty());
    }

    #[test]
    fn cashed_out_wagers_survive_settlement() {
        let store = new_store();
        let user = seed_user(&store, "gina", Money::from_major(100));
        let round = seed_round(&store, 200);
        let placed = place(&store, &user, &round, 5000);

        open_running(&store, &round);
        store
            .cashout_wager(placed.wager.id, Multiplier::from_x100(150))
            .unwrap();
        store
            .update_round_status(round.id, RoundStatus::Crashed)
            .unwrap();

        assert!(store.settle_crashed_round(round.id).unwrap().is_empty());
        assert_eq!(
            store.find_wager(placed.wager.id).unwrap().status,
            WagerStatus::CashedOut
        );
    }

    #[test]
    fn daily_wager_limit_enforced() {
        let store = new_store();
        let user = seed_user(&store, "hank", Money::from_major(1000));

        store
            .upsert_player_settings(
                user.id,
                SettingsPatch {
                    daily_limits_enabled: Some(true),
                    max_daily_wager: Some(Money::from_major(50)),
                    ..Default::default()
                },
            )
            .unwrap();

        let round = seed_round(&store, 150);
        place(&store, &user, &round, 4000); // 40.00 of the 50.00 allowance

        store
            .update_round_status(round.id, RoundStatus::Running)
            .unwrap();
        store
            .update_round_status(round.id, RoundStatus::Crashed)
            .unwrap();
        store.settle_crashed_round(round.id).unwrap();

        let next = seed_round(&store, 150);
        let err = store
            .place_wager(user.id, next.id, Money::from_major(20), None)
            .unwrap_err();
        assert!(matches!(err, Error::DailyLimitExceeded(_)));

        // Within the remaining allowance is fine.
        store
            .place_wager(user.id, next.id, Money::from_major(10), None)
            .unwrap();
    }
}
