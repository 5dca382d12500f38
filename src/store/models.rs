//! Durable entity types owned by the persistence gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::money::{Money, Multiplier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Player,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Player => "PLAYER",
            Role::Admin => "ADMIN",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "PLAYER" => Some(Role::Player),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered player or administrator. Never deleted; deactivated via
/// `is_active`.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub external_id: Option<String>,
    pub username: String,
    pub role: Role,
    pub balance: Money,
    pub total_wagered: Money,
    pub total_won: Money,
    pub total_lost: Money,
    pub games_played: i64,
    pub biggest_win: Money,
    pub biggest_loss: Money,
    pub xp: i64,
    pub level: i64,
    pub is_active: bool,
    pub password_hash: Option<String>,
    pub last_farming_claim: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    /// Aggregate profit definition: winnings minus losses.
    pub fn net_profit(&self) -> Money {
        self.total_won - self.total_lost
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Betting,
    Running,
    Crashed,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Betting => "BETTING",
            RoundStatus::Running => "RUNNING",
            RoundStatus::Crashed => "CRASHED",
        }
    }

    pub fn parse(value: &str) -> Option<RoundStatus> {
        match value {
            "BETTING" => Some(RoundStatus::Betting),
            "RUNNING" => Some(RoundStatus::Running),
            "CRASHED" => Some(RoundStatus::Crashed),
            _ => None,
        }
    }
}

/// One committed game cycle. Immutable once CRASHED.
#[derive(Debug, Clone)]
pub struct Round {
    pub id: i64,
    pub round_number: i64,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub nonce: i64,
    pub crash: Multiplier,
    pub status: RoundStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WagerStatus {
    Active,
    CashedOut,
    Lost,
    Cancelled,
}

impl WagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WagerStatus::Active => "ACTIVE",
            WagerStatus::CashedOut => "CASHED_OUT",
            WagerStatus::Lost => "LOST",
            WagerStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<WagerStatus> {
        match value {
            "ACTIVE" => Some(WagerStatus::Active),
            "CASHED_OUT" => Some(WagerStatus::CashedOut),
            "LOST" => Some(WagerStatus::Lost),
            "CANCELLED" => Some(WagerStatus::Cancelled),
            _ => None,
        }
    }
}

/// A user's stake in one round. At most one per (user, round).
#[derive(Debug, Clone)]
pub struct Wager {
    pub id: i64,
    pub user_id: i64,
    pub round_id: i64,
    pub stake: Money,
    pub auto_cashout: Option<Multiplier>,
    pub cashout: Option<Multiplier>,
    pub payout: Option<Money>,
    pub status: WagerStatus,
    pub placed_at: DateTime<Utc>,
    pub cashed_out_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    Deposit,
    Withdrawal,
    BetPlaced,
    BetWon,
    BetLost,
    FarmingClaim,
    Adjustment,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Deposit => "DEPOSIT",
            LedgerEntryType::Withdrawal => "WITHDRAWAL",
            LedgerEntryType::BetPlaced => "BET_PLACED",
            LedgerEntryType::BetWon => "BET_WON",
            LedgerEntryType::BetLost => "BET_LOST",
            LedgerEntryType::FarmingClaim => "FARMING_CLAIM",
            LedgerEntryType::Adjustment => "ADJUSTMENT",
        }
    }

    pub fn parse(value: &str) -> Option<LedgerEntryType> {
        match value {
            "DEPOSIT" => Some(LedgerEntryType::Deposit),
            "WITHDRAWAL" => Some(LedgerEntryType::Withdrawal),
            "BET_PLACED" => Some(LedgerEntryType::BetPlaced),
            "BET_WON" => Some(LedgerEntryType::BetWon),
            "BET_LOST" => Some(LedgerEntryType::BetLost),
            "FARMING_CLAIM" => Some(LedgerEntryType::FarmingClaim),
            "ADJUSTMENT" => Some(LedgerEntryType::Adjustment),
        _ => None,
        }
    }
}

/// Append-only record of one balance delta, with before/after snapshots.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: i64,
    pub wager_id: Option<i64>,
    pub entry_type: LedgerEntryType,
    /// Always positive; direction comes from the entry type.
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// The signed delta this entry applied to the balance.
    pub fn signed_amount(&self) -> Money {
        self.balance_after - self.balance_before
    }
}

/// Per-player preferences, upserted as a whole row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSettings {
    pub user_id: i64,
    pub auto_cashout_enabled: bool,
    pub auto_cashout: Option<Multiplier>,
    pub sound_enabled: bool,
    pub daily_limits_enabled: bool,
    pub max_daily_wager: Money,
    pub max_daily_loss: Money,
    pub max_games_per_day: i64,
}

/// Per-user, per-calendar-day usage counters.
#[derive(Debug, Clone, Default)]
pub struct DailyCounters {
    pub wagered: Money,
    pub lost: Money,
    pub games: i64,
}

/// One row of the fairness audit feed. `server_seed` is `None` while the
/// round is inside the reveal grace period.
#[derive(Debug, Clone, Serialize)]
pub struct FairRound {
    pub round_number: i64,
    pub server_seed: Option<String>,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub nonce: i64,
    pub crash_point: Multiplier,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for status in [
            WagerStatus::Active,
            WagerStatus::CashedOut,
            WagerStatus::Lost,
            WagerStatus::Cancelled,
        ] {
            assert_eq!(WagerStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            RoundStatus::Betting,
            RoundStatus::Running,
            RoundStatus::Crashed,
        ] {
            assert_eq!(RoundStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(Role::parse("ADMIN"), Some(Role::Admin));
        assert_eq!(Role::parse("nope"), None);
        assert_eq!(
            LedgerEntryType::parse("FARMING_CLAIM"),
            Some(LedgerEntryType::FarmingClaim)
        );
    }

    #[test]
    fn net_profit_is_won_minus_lost() {
        let mut user = test_user();
        user.total_won = Money::from_major(500);
        user.total_lost = Money::from_major(200);
        user.total_wagered = Money::from_major(900);
        assert_eq!(user.net_profit(), Money::from_major(300));
    }

    fn test_user() -> User {
        User {
            id: 1,
            external_id: None,
            username: "tester".to_string(),
            role: Role::Player,
            balance: Money::ZERO,
            total_wagered: Money::ZERO,
            total_won: Money::ZERO,
            total_lost: Money::ZERO,
            games_played: 0,
            biggest_win: Money::ZERO,
            biggest_loss: Money::ZERO,
            xp: 0,
            level: 1,
            is_active: true,
            password_hash: None,
            last_farming_claim: None,
            created_at: Utc::now(),
            last_login_at: None,
        }
    }
}
