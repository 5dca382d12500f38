//! User accounts, balances, and the ledger.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

use crate::config::DailyLimitsConfig;
use crate::errors::{Error, Result};
use crate::money::Money;

use super::models::{LedgerEntry, LedgerEntryType, Role, User};
use super::{format_ts, parse_opt_ts, parse_ts, Store};

/// Input for account creation.
pub struct NewUser<'a> {
    pub username: &'a str,
    pub external_id: Option<&'a str>,
    pub role: Role,
    pub balance: Money,
    pub password_hash: Option<&'a str>,
    pub daily_defaults: &'a DailyLimitsConfig,
}

/// Partial update for administrative edits.
#[derive(Debug, Default)]
pub struct UserPatch {
    pub username: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderboardSort {
    Balance,
    TotalWon,
    WinRate,
    Level,
}

impl LeaderboardSort {
    pub fn parse(value: &str) -> Option<LeaderboardSort> {
        match value {
            "balance" => Some(LeaderboardSort::Balance),
            "totalWon" => Some(LeaderboardSort::TotalWon),
            "winRate" => Some(LeaderboardSort::WinRate),
            "level" => Some(LeaderboardSort::Level),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub username: String,
    pub level: i64,
    pub balance: Money,
    pub total_won: Money,
    pub games_played: i64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FarmingStatus {
    pub can_claim: bool,
    pub next_claim_at: Option<DateTime<Utc>>,
    pub reward: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub total_users: i64,
    pub active_users_24h: i64,
    pub total_wagered: Money,
    pub total_won: Money,
    pub total_lost: Money,
    /// From the ledger: bets taken in minus winnings paid out.
    pub house_profit: Money,
    pub rounds_played: i64,
}

impl Store {
    /// Insert a user row together with its default settings row.
    pub fn create_user(&self, new: NewUser<'_>) -> Result<User> {
        self.with_tx(|tx| {
            let now = format_ts(Utc::now());
            tx.execute(
                "INSERT INTO users (external_id, username, role, balance, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.external_id,
                    new.username,
                    new.role.as_str(),
                    new.balance.minor(),
                    new.password_hash,
                    now,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(inner, _)
                    if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Error::AlreadyExists(format!("user '{}'", new.username))
                }
                other => other.into(),
            })?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO player_settings
                     (user_id, max_daily_wager, max_daily_loss, max_games_per_day)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id,
                    new.daily_defaults.default_max_wager,
                    new.daily_defaults.default_max_loss,
                    new.daily_defaults.default_max_games,
                ],
            )?;

            get_user(tx, id)
        })
    }

    pub fn find_user(&self, id: i64) -> Result<User> {
        self.with_conn(|conn| get_user(conn, id))
    }

    pub fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{} WHERE external_id = ?1", SELECT_USER),
                params![external_id],
                row_to_user,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{} WHERE username = ?1", SELECT_USER),
                params![username],
                row_to_user,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Find-or-create for the external-platform login path. Refreshes the
    /// display handle and last-login stamp on every successful login.
    pub fn upsert_platform_user(
        &self,
        external_id: &str,
        username: &str,
        starting_balance: Money,
        daily_defaults: &DailyLimitsConfig,
    ) -> Result<User> {
        let existing = self.find_user_by_external_id(external_id)?;
        match existing {
            Some(user) => {
                self.with_tx(|tx| {
                    tx.execute(
                        "UPDATE users SET username = ?1, last_login_at = ?2 WHERE id = ?3",
                        params![username, format_ts(Utc::now()), user.id],
                    )?;
                    Ok(())
                })?;
                self.find_user(user.id)
            }
            None => self.create_user(NewUser {
                username,
                external_id: Some(external_id),
                role: Role::Player,
                balance: starting_balance,
                password_hash: None,
                daily_defaults,
            }),
        }
    }

    pub fn update_user(&self, id: i64, patch: UserPatch) -> Result<User> {
        self.with_tx(|tx| {
            // Ensure the row exists before patching.
            let _ = get_user(tx, id)?;
            if let Some(ref username) = patch.username {
                tx.execute(
                    "UPDATE users SET username = ?1 WHERE id = ?2",
                    params![username, id],
                )?;
            }
            if let Some(role) = patch.role {
                tx.execute(
                    "UPDATE users SET role = ?1 WHERE id = ?2",
                    params![role.as_str(), id],
                )?;
            }
            if let Some(active) = patch.is_active {
                tx.execute(
                    "UPDATE users SET is_active = ?1 WHERE id = ?2",
                    params![active as i64, id],
                )?;
            }
            get_user(tx, id)
        })
    }

    pub fn set_password_hash(&self, id: i64, password_hash: &str) -> Result<()> {
        self.with_tx(|tx| {
            let affected = tx.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![password_hash, id],
            )?;
            if affected == 0 {
                return Err(Error::NotFound(format!("user {}", id)));
            }
            Ok(())
        })
    }

    pub fn touch_last_login(&self, id: i64) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
                params![format_ts(Utc::now()), id],
            )?;
            Ok(())
        })
    }

    /// Apply a signed delta to a balance and write the matching ledger row,
    /// atomically. Fails with `InsufficientFunds` if the result would be
    /// negative.
    pub fn adjust_balance(
        &self,
        user_id: i64,
        signed_amount: Money,
        entry_type: LedgerEntryType,
        description: &str,
        wager_id: Option<i64>,
    ) -> Result<Money> {
        self.with_tx(|tx| {
            let (_, after) = apply_balance_delta(
                tx,
                user_id,
                signed_amount,
                entry_type,
                description,
                wager_id,
            )?;
            Ok(after)
        })
    }

    pub fn ledger_for_user(&self, user_id: i64, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, wager_id, entry_type, amount,
                        balance_before, balance_after, description, created_at
                 FROM ledger WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], row_to_ledger_entry)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    /// Claim the farming reward. Enforces the cooldown; on success credits
    /// the reward, writes a ledger entry, and grants XP.
    pub fn claim_farming(&self, user_id: i64, reward: Money, cycle_secs: i64) -> Result<Money> {
        self.with_tx(|tx| {
            let user = get_user(tx, user_id)?;
            let now = Utc::now();
            if let Some(last) = user.last_farming_claim {
                let ready_at = last + Duration::seconds(cycle_secs);
                if now < ready_at {
                    return Err(Error::FailedPrecondition(format!(
                        "farming ready at {}",
                        ready_at.to_rfc3339()
                    )));
                }
            }

            let (_, after) = apply_balance_delta(
                tx,
                user_id,
                reward,
                LedgerEntryType::FarmingClaim,
                "farming cycle reward",
                None,
            )?;

            let xp_gain = reward.minor() / 100;
            tx.execute(
                "UPDATE users
                 SET last_farming_claim = ?1,
                     xp = xp + ?2,
                     level = (xp + ?2) / 1000 + 1
                 WHERE id = ?3",
                params![format_ts(now), xp_gain, user_id],
            )?;

            Ok(after)
        })
    }

    pub fn farming_status(&self, user_id: i64, reward: Money, cycle_secs: i64) -> Result<FarmingStatus> {
        let user = self.find_user(user_id)?;
        let now = Utc::now();
        let next_claim_at = user
            .last_farming_claim
            .map(|last| last + Duration::seconds(cycle_secs));
        let can_claim = next_claim_at.map(|at| now >= at).unwrap_or(true);
        Ok(FarmingStatus {
            can_claim,
            next_claim_at: if can_claim { None } else { next_claim_at },
            reward,
        })
    }

    /// Ranked players. Win-rate ordering excludes users with fewer than
    /// `min_games` games so one lucky round cannot top the board.
    pub fn leaderboard(
        &self,
        sort: LeaderboardSort,
        limit: usize,
        min_games: i64,
    ) -> Result<Vec<LeaderboardEntry>> {
        self.with_conn(|conn| {
            let base = "SELECT u.username, u.level, u.balance, u.total_won, u.games_played,
                               (SELECT COUNT(*) FROM wagers w
                                WHERE w.user_id = u.id AND w.status = 'CASHED_OUT') AS wins
                        FROM users u
                        WHERE u.is_active = 1";
            let sql = match sort {
                LeaderboardSort::Balance => {
                    format!("{} ORDER BY u.balance DESC LIMIT ?1", base)
                }
                LeaderboardSort::TotalWon => {
                    format!("{} ORDER BY u.total_won DESC LIMIT ?1", base)
                }
                LeaderboardSort::Level => {
                    format!("{} ORDER BY u.level DESC, u.xp DESC LIMIT ?1", base)
                }
                LeaderboardSort::WinRate => format!(
                    "{} AND u.games_played >= ?2
                     ORDER BY CAST(wins AS REAL) / u.games_played DESC LIMIT ?1",
                    base
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<LeaderboardEntry> {
                let games_played: i64 = row.get(4)?;
                let wins: i64 = row.get(5)?;
                Ok(LeaderboardEntry {
                    username: row.get(0)?,
                    level: row.get(1)?,
                    balance: Money::from_minor(row.get(2)?),
                    total_won: Money::from_minor(row.get(3)?),
                    games_played,
                    win_rate: if games_played > 0 {
                        wins as f64 / games_played as f64
                    } else {
                        0.0
                    },
                })
            };

            let rows: Vec<_> = match sort {
                LeaderboardSort::WinRate => stmt
                    .query_map(params![limit as i64, min_games], map_row)?
                    .collect::<rusqlite::Result<_>>()?,
                _ => stmt
                    .query_map(params![limit as i64], map_row)?
                    .collect::<rusqlite::Result<_>>()?,
            };
            Ok(rows)
        })
    }

    pub fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<User>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{} ORDER BY id LIMIT ?1 OFFSET ?2", SELECT_USER))?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_user)?;
            let mut users = Vec::new();
            for row in rows {
                users.push(row?);
            }
            Ok(users)
        })
    }

    pub fn admin_stats(&self) -> Result<AdminStats> {
        self.with_conn(|conn| {
            let (total_users, total_wagered, total_won, total_lost): (i64, i64, i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(total_wagered), 0),
                            COALESCE(SUM(total_won), 0),
                            COALESCE(SUM(total_lost), 0)
                     FROM users",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;

            let cutoff = format_ts(Utc::now() - Duration::hours(24));
            let active_users_24h: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE last_login_at >= ?1",
                params![cutoff],
                |row| row.get(0),
            )?;

            let taken_in: i64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM ledger WHERE entry_type = 'BET_PLACED'",
                [],
                |row| row.get(0),
            )?;
            let paid_out: i64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM ledger WHERE entry_type = 'BET_WON'",
                [],
                |row| row.get(0),
            )?;

            let rounds_played: i64 = conn.query_row(
                "SELECT COUNT(*) FROM rounds WHERE status = 'CRASHED'",
                [],
                |row| row.get(0),
            )?;

            Ok(AdminStats {
                total_users,
                active_users_24h,
                total_wagered: Money::from_minor(total_wagered),
                total_won: Money::from_minor(total_won),
                total_lost: Money::from_minor(total_lost),
                house_profit: Money::from_minor(taken_in - paid_out),
                rounds_played,
            })
        })
    }
}

const SELECT_USER: &str = "SELECT id, external_id, username, role, balance, total_wagered,
            total_won, total_lost, games_played, biggest_win, biggest_loss,
            xp, level, is_active, password_hash, last_farming_claim,
            created_at, last_login_at
     FROM users";

pub(super) fn get_user(conn: &Connection, id: i64) -> Result<User> {
    conn.query_row(
        &format!("{} WHERE id = ?1", SELECT_USER),
        params![id],
        row_to_user,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("user {}", id)))
}

/// Core of every balance mutation: read, bound-check, write user row and
/// ledger row under the caller's transaction. Returns (before, after).
pub(super) fn apply_balance_delta(
    tx: &Transaction<'_>,
    user_id: i64,
    signed_amount: Money,
    entry_type: LedgerEntryType,
    description: &str,
    wager_id: Option<i64>,
) -> Result<(Money, Money)> {
    let before = Money::from_minor(
        tx.query_row(
            "SELECT balance FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?,
    );

    let after = before
        .checked_add(signed_amount)
        .ok_or_else(|| Error::internal("balance overflow"))?;
    if after.is_negative() {
        return Err(Error::InsufficientFunds);
    }

    tx.execute(
        "UPDATE users SET balance = ?1 WHERE id = ?2",
        params![after.minor(), user_id],
    )?;
    tx.execute(
        "INSERT INTO ledger
             (user_id, wager_id, entry_type, amount, balance_before, balance_after,
              description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user_id,
            wager_id,
            entry_type.as_str(),
            signed_amount.abs().minor(),
            before.minor(),
            after.minor(),
            description,
            format_ts(Utc::now()),
        ],
    )?;

    Ok((before, after))
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role_str: String = row.get(3)?;
    let role = Role::parse(&role_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown role '{}'", role_str).into(),
        )
    })?;

    Ok(User {
        id: row.get(0)?,
        external_id: row.get(1)?,
        username: row.get(2)?,
        role,
        balance: Money::from_minor(row.get(4)?),
        total_wagered: Money::from_minor(row.get(5)?),
        total_won: Money::from_minor(row.get(6)?),
        total_lost: Money::from_minor(row.get(7)?),
        games_played: row.get(8)?,
        biggest_win: Money::from_minor(row.get(9)?),
        biggest_loss: Money::from_minor(row.get(10)?),
        xp: row.get(11)?,
        level: row.get(12)?,
        is_active: row.get::<_, i64>(13)? != 0,
        password_hash: row.get(14)?,
        last_farming_claim: parse_opt_ts(15, row.get(15)?)?,
        created_at: parse_ts(16, &row.get::<_, String>(16)?)?,
        last_login_at: parse_opt_ts(17, row.get(17)?)?,
    })
}

fn row_to_ledger_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let type_str: String = row.get(3)?;
    let entry_type = LedgerEntryType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown ledger type '{}'", type_str).into(),
        )
    })?;

    Ok(LedgerEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        wager_id: row.get(2)?,
        entry_type,
        amount: Money::from_minor(row.get(4)?),
        balance_before: Money::from_minor(row.get(5)?),
        balance_after: Money::from_minor(row.get(6)?),
        description: row.get(7)?,
        created_at: parse_ts(8, &row.get::<_, String>(8)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{new_store, seed_user};

    #[test]
    fn create_and_find_user() {
        let store = new_store();
        let user = seed_user(&store, "alice", Money::from_major(1000));

        assert_eq!(user.username, "alice");
        assert_eq!(user.balance, Money::from_major(1000));
        assert_eq!(user.role, Role::Player);
        assert!(user.is_active);

        let found = store.find_user(user.id).unwrap();
        assert_eq!(found.id, user.id);

        // Settings row created alongside.
        let settings = store.get_player_settings(user.id).unwrap();
        assert_eq!(settings.user_id, user.id);
    }

    #[test]
    fn duplicate_username_rejected() {
        let store = new_store();
        seed_user(&store, "bob", Money::ZERO);
        let defaults = DailyLimitsConfig::default();
        let err = store
            .create_user(NewUser {
                username: "bob",
                external_id: None,
                role: Role::Player,
                balance: Money::ZERO,
                password_hash: None,
                daily_defaults: &defaults,
            })
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn adjust_balance_writes_ledger_and_blocks_negative() {
        let store = new_store();
        let user = seed_user(&store, "carol", Money::from_major(10));

        let after = store
            .adjust_balance(
                user.id,
                Money::from_major(5),
                LedgerEntryType::Deposit,
                "deposit",
                None,
            )
            .unwrap();
        assert_eq!(after, Money::from_major(15));

        let err = store
            .adjust_balance(
                user.id,
                -Money::from_major(100),
                LedgerEntryType::Withdrawal,
                "too much",
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds));

        // The failed attempt left no ledger row behind.
        let entries = store.ledger_for_user(user.id, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, LedgerEntryType::Deposit);
        assert_eq!(entries[0].balance_after, Money::from_major(15));
    }

    #[test]
    fn ledger_sum_matches_balance() {
        let store = new_store();
        let user = seed_user(&store, "dave", Money::ZERO);

        for amount in [500, 2500, -1000, 300] {
            let money = Money::from_minor(amount);
            let entry_type = if amount >= 0 {
                LedgerEntryType::Deposit
            } else {
                LedgerEntryType::Withdrawal
            };
            store
                .adjust_balance(user.id, money, entry_type, "test", None)
                .unwrap();
        }

        let entries = store.ledger_for_user(user.id, 100).unwrap();
        let sum: i64 = entries.iter().map(|e| e.signed_amount().minor()).sum();
        let current = store.find_user(user.id).unwrap().balance;
        assert_eq!(sum, current.minor());
    }

    #[test]
    fn farming_claim_enforces_cooldown() {
        let store = new_store();
        let user = seed_user(&store, "erin", Money::ZERO);
        let reward = Money::from_minor(6000);

        let status = store.farming_status(user.id, reward, 21_600).unwrap();
        assert!(status.can_claim);

        let balance = store.claim_farming(user.id, reward, 21_600).unwrap();
        assert_eq!(balance, reward);

        let err = store.claim_farming(user.id, reward, 21_600).unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));

        let status = store.farming_status(user.id, reward, 21_600).unwrap();
        assert!(!status.can_claim);
        assert!(status.next_claim_at.is_some());

        // Zero-cooldown claims succeed immediately.
        store.claim_farming(user.id, reward, 0).unwrap();
    }

    #[test]
    fn update_user_patches_fields() {
        let store = new_store();
        let user = seed_user(&store, "frank", Money::ZERO);

        let updated = store
            .update_user(
                user.id,
                UserPatch {
                    role: Some(Role::Admin),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.role, Role::Admin);
        assert!(!updated.is_active);
    }

    #[test]
    fn upsert_platform_user_is_idempotent() {
        let store = new_store();
        let defaults = DailyLimitsConfig::default();

        let first = store
            .upsert_platform_user("tg:1234", "gina", Money::from_major(100), &defaults)
            .unwrap();
        let second = store
            .upsert_platform_user("tg:1234", "gina-renamed", Money::from_major(100), &defaults)
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.username, "gina-renamed");
        // Balance untouched by re-login.
        assert_eq!(second.balance, Money::from_major(100));
    }

    #[test]
    fn leaderboard_win_rate_excludes_fresh_users() {
        let store = new_store();
        let veteran = seed_user(&store, "veteran", Money::from_major(100));
        let _rookie = seed_user(&store, "rookie", Money::from_major(100));

        store
            .with_tx(|tx| {
                tx.execute(
                    "UPDATE users SET games_played = 20 WHERE id = ?1",
                    params![veteran.id],
                )?;
                Ok(())
            })
            .unwrap();

        let board = store
            .leaderboard(LeaderboardSort::WinRate, 10, 10)
            .unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].username, "veteran");
    }
}
