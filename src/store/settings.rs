//! Player settings and daily-limit counters.

use rusqlite::{params, OptionalExtension};

use crate::errors::{Error, Result};
use crate::money::{Money, Multiplier};

use super::models::{DailyCounters, PlayerSettings};
use super::{day_key, Store};

/// Partial settings update. Only the allowlisted fields exist here; anything
/// else in a client payload is rejected at the API boundary.
#[derive(Debug, Default, Clone)]
pub struct SettingsPatch {
    pub auto_cashout_enabled: Option<bool>,
    pub auto_cashout: Option<Multiplier>,
    pub sound_enabled: Option<bool>,
    pub daily_limits_enabled: Option<bool>,
    pub max_daily_wager: Option<Money>,
    pub max_daily_loss: Option<Money>,
    pub max_games_per_day: Option<i64>,
}

impl Store {
    pub fn get_player_settings(&self, user_id: i64) -> Result<PlayerSettings> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, auto_cashout_enabled, auto_cashout_x100, sound_enabled,
                        daily_limits_enabled, max_daily_wager, max_daily_loss, max_games_per_day
                 FROM player_settings WHERE user_id = ?1",
                params![user_id],
                row_to_settings,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("settings for user {}", user_id)))
        })
    }

    /// Apply a partial update and return the stored row.
    pub fn upsert_player_settings(
        &self,
        user_id: i64,
        patch: SettingsPatch,
    ) -> Result<PlayerSettings> {
        self.with_tx(|tx| {
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM player_settings WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(Error::NotFound(format!("settings for user {}", user_id)));
            }

            if let Some(enabled) = patch.auto_cashout_enabled {
                tx.execute(
                    "UPDATE player_settings SET auto_cashout_enabled = ?1 WHERE user_id = ?2",
                    params![enabled as i64, user_id],
                )?;
            }
            if let Some(threshold) = patch.auto_cashout {
                tx.execute(
                    "UPDATE player_settings SET auto_cashout_x100 = ?1 WHERE user_id = ?2",
                    params![threshold.x100() as i64, user_id],
                )?;
            }
            if let Some(enabled) = patch.sound_enabled {
                tx.execute(
                    "UPDATE player_settings SET sound_enabled = ?1 WHERE user_id = ?2",
                    params![enabled as i64, user_id],
                )?;
            }
            if let Some(enabled) = patch.daily_limits_enabled {
                tx.execute(
                    "UPDATE player_settings SET daily_limits_enabled = ?1 WHERE user_id = ?2",
                    params![enabled as i64, user_id],
                )?;
            }
            if let Some(max) = patch.max_daily_wager {
                if !max.is_positive() {
                    return Err(Error::invalid("max_daily_wager must be positive"));
                }
                tx.execute(
                    "UPDATE player_settings SET max_daily_wager = ?1 WHERE user_id = ?2",
                    params![max.minor(), user_id],
                )?;
            }
            if let Some(max) = patch.max_daily_loss {
                if !max.is_positive() {
                    return Err(Error::invalid("max_daily_loss must be positive"));
                }
                tx.execute(
                    "UPDATE player_settings SET max_daily_loss = ?1 WHERE user_id = ?2",
                    params![max.minor(), user_id],
                )?;
            }
            if let Some(max) = patch.max_games_per_day {
                if max <= 0 {
                    return Err(Error::invalid("max_games_per_day must be positive"));
                }
                tx.execute(
                    "UPDATE player_settings SET max_games_per_day = ?1 WHERE user_id = ?2",
                    params![max, user_id],
                )?;
            }

            tx.query_row(
                "SELECT user_id, auto_cashout_enabled, auto_cashout_x100, sound_enabled,
                        daily_limits_enabled, max_daily_wager, max_daily_loss, max_games_per_day
                 FROM player_settings WHERE user_id = ?1",
                params![user_id],
                row_to_settings,
            )
            .map_err(Into::into)
        })
    }

    /// Today's usage counters for a user; zeroes when nothing recorded yet.
    pub fn daily_counters(&self, user_id: i64) -> Result<DailyCounters> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT wagered, lost, games FROM daily_limits
                     WHERE user_id = ?1 AND day = ?2",
                    params![user_id, day_key(chrono::Utc::now())],
                    |row| {
                        Ok(DailyCounters {
                            wagered: Money::from_minor(row.get(0)?),
                            lost: Money::from_minor(row.get(1)?),
                            games: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row.unwrap_or_default())
        })
    }
}

fn row_to_settings(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlayerSettings> {
    Ok(PlayerSettings {
        user_id: row.get(0)?,
        auto_cashout_enabled: row.get::<_, i64>(1)? != 0,
        auto_cashout: row
            .get::<_, Option<i64>>(2)?
            .map(|v| Multiplier::from_x100(v as u64)),
        sound_enabled: row.get::<_, i64>(3)? != 0,
        daily_limits_enabled: row.get::<_, i64>(4)? != 0,
        max_daily_wager: Money::from_minor(row.get(5)?),
        max_daily_loss: Money::from_minor(row.get(6)?),
        max_games_per_day: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{new_store, seed_user};

    #[test]
    fn settings_partial_update_round_trips() {
        let store = new_store();
        let user = seed_user(&store, "alice", Money::ZERO);

        let before = store.get_player_settings(user.id).unwrap();
        assert!(!before.auto_cashout_enabled);
        assert!(before.sound_enabled);

        let updated = store
            .upsert_player_settings(
                user.id,
                SettingsPatch {
                    auto_cashout_enabled: Some(true),
                    auto_cashout: Some(Multiplier::from_x100(200)),
                    sound_enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.auto_cashout_enabled);
        assert_eq!(updated.auto_cashout, Some(Multiplier::from_x100(200)));
        assert!(!updated.sound_enabled);

        // Untouched fields keep their values.
        assert_eq!(updated.max_daily_wager, before.max_daily_wager);

        let fetched = store.get_player_settings(user.id).unwrap();
        assert!(fetched.auto_cashout_enabled);
        assert_eq!(fetched.auto_cashout, Some(Multiplier::from_x100(200)));
    }

    #[test]
    fn non_positive_limits_rejected() {
        let store = new_store();
        let user = seed_user(&store, "bob", Money::ZERO);

        let err = store
            .upsert_player_settings(
                user.id,
                SettingsPatch {
                    max_daily_wager: Some(Money::ZERO),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, crate::errors::Error::InvalidArgument { .. }));
    }

    #[test]
    fn daily_counters_default_to_zero() {
        let store = new_store();
        let user = seed_user(&store, "carol", Money::ZERO);
        let counters = store.daily_counters(user.id).unwrap();
        assert_eq!(counters.wagered, Money::ZERO);
        assert_eq!(counters.games, 0);
    }

    #[test]
    fn unknown_user_settings_not_found() {
        let store = new_store();
        assert!(store.get_player_settings(999).is_err());
    }
}
