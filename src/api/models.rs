//! Request and response DTOs for the request-reply surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::auth::TokenPair;
use crate::money::{Money, Multiplier};
use crate::store::models::{PlayerSettings, Role, User};

/// External-platform login: the platform's signed identity payload, passed
/// through verbatim as string fields (including `hash`).
#[derive(Debug, Deserialize)]
pub struct PlatformLoginRequest {
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct AdminLoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminRegisterRequest {
    pub username: String,
    pub password: String,
    pub registration_key: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: ProfileResponse,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub balance: Money,
    pub total_wagered: Money,
    pub total_won: Money,
    pub total_lost: Money,
    pub net_profit: Money,
    pub games_played: i64,
    pub biggest_win: Money,
    pub biggest_loss: Money,
    pub xp: i64,
    pub level: i64,
    pub created_at: DateTime<Utc>,
}

impl From<User> for ProfileResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
            balance: user.balance,
            total_wagered: user.total_wagered,
            total_won: user.total_won,
            total_lost: user.total_lost,
            net_profit: user.net_profit(),
            games_played: user.games_played,
            biggest_win: user.biggest_win,
            biggest_loss: user.biggest_loss,
            xp: user.xp,
            level: user.level,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub auto_cashout_enabled: bool,
    pub auto_cashout: Option<Multiplier>,
    pub sound_enabled: bool,
    pub daily_limits_enabled: bool,
    pub max_daily_wager: Money,
    pub max_daily_loss: Money,
    pub max_games_per_day: i64,
}

impl From<PlayerSettings> for SettingsResponse {
    fn from(settings: PlayerSettings) -> Self {
        Self {
            auto_cashout_enabled: settings.auto_cashout_enabled,
            auto_cashout: settings.auto_cashout,
            sound_enabled: settings.sound_enabled,
            daily_limits_enabled: settings.daily_limits_enabled,
            max_daily_wager: settings.max_daily_wager,
            max_daily_loss: settings.max_daily_loss,
            max_games_per_day: settings.max_games_per_day,
        }
    }
}

/// Allowlisted, partial settings update. Unknown fields are rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdateRequest {
    pub auto_cashout_enabled: Option<bool>,
    pub auto_cashout: Option<Multiplier>,
    pub sound_enabled: Option<bool>,
    pub daily_limits_enabled: Option<bool>,
    pub max_daily_wager: Option<Money>,
    pub max_daily_loss: Option<Money>,
    pub max_games_per_day: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_sort() -> String {
    "balance".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_page_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminUpdateUserRequest {
    pub username: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
    /// Signed manual adjustment, booked as an ADJUSTMENT ledger entry.
    pub balance_adjustment: Option<f64>,
    #[serde(default)]
    pub adjustment_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdminUserRow {
    pub id: i64,
    pub external_id: Option<String>,
    pub username: String,
    pub role: Role,
    pub balance: Money,
    pub games_played: i64,
    pub net_profit: Money,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<User> for AdminUserRow {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            external_id: user.external_id.clone(),
            username: user.username.clone(),
            role: user.role,
            balance: user.balance,
            games_played: user.games_played,
            net_profit: user.net_profit(),
            is_active: user.is_active,
            created_at: user.created_at,
            last_login_at: user.last_login_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_update_rejects_unknown_fields() {
        let ok: SettingsUpdateRequest =
            serde_json::from_str(r#"{"sound_enabled":false,"auto_cashout":2.5}"#).unwrap();
        assert_eq!(ok.sound_enabled, Some(false));
        assert_eq!(ok.auto_cashout, Some(Multiplier::from_x100(250)));
        assert!(ok.max_daily_wager.is_none());

        assert!(
            serde_json::from_str::<SettingsUpdateRequest>(r#"{"balance":99999}"#).is_err()
        );
        assert!(serde_json::from_str::<SettingsUpdateRequest>(
            r#"{"sound_enabled":true,"role":"ADMIN"}"#
        )
        .is_err());
    }

    #[test]
    fn profile_includes_net_profit() {
        let user = User {
            id: 1,
            external_id: None,
            username: "p".to_string(),
            role: Role::Player,
            balance: Money::from_major(10),
            total_wagered: Money::from_major(100),
            total_won: Money::from_major(80),
            total_lost: Money::from_major(50),
            games_played: 9,
            biggest_win: Money::from_major(30),
            biggest_loss: Money::from_major(20),
            xp: 100,
            level: 1,
            is_active: true,
            password_hash: None,
            last_farming_claim: None,
            created_at: Utc::now(),
            last_login_at: None,
        };
        let profile = ProfileResponse::from(user);
        assert_eq!(profile.net_profit, Money::from_major(30));
    }

    #[test]
    fn platform_login_collects_flat_fields() {
        let request: PlatformLoginRequest = serde_json::from_str(
            r#"{"id":"1","username":"u","auth_date":"123","hash":"aa"}"#,
        )
        .unwrap();
        assert_eq!(request.fields.len(), 4);
        assert_eq!(request.fields.get("id").map(String::as_str), Some("1"));
    }
}
