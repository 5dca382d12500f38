//! Round rows: creation, status transitions, and the fairness audit feed.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::errors::{Error, Result};
use crate::fairness::RoundPlan;
use crate::money::{Money, Multiplier};

use super::models::{FairRound, Round, RoundStatus};
use super::{format_ts, parse_opt_ts, parse_ts, Store};

/// Admin view of a round with its wagering totals.
#[derive(Debug, Clone, Serialize)]
pub struct RoundListEntry {
    pub round_number: i64,
    pub crash_point: Multiplier,
    pub status: RoundStatus,
    pub wager_count: i64,
    pub total_staked: Money,
    pub total_paid: Money,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Store {
    /// Insert a round in BETTING with the next monotonic round number.
    pub fn create_round(&self, plan: &RoundPlan) -> Result<Round> {
        self.with_tx(|tx| {
            // Only one round may be live at a time.
            let live: i64 = tx.query_row(
                "SELECT COUNT(*) FROM rounds WHERE status IN ('BETTING', 'RUNNING')",
                [],
                |row| row.get(0),
            )?;
            if live > 0 {
                return Err(Error::FailedPrecondition(
                    "another round is still live".to_string(),
                ));
            }

            let next_number: i64 = tx.query_row(
                "SELECT COALESCE(MAX(round_number), 0) + 1 FROM rounds",
                [],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO rounds
                     (round_number, server_seed, server_seed_hash, client_seed, nonce,
                      crash_x100, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'BETTING', ?7)",
                params![
                    next_number,
                    plan.server_seed,
                    plan.server_seed_hash,
                    plan.client_seed,
                    plan.nonce as i64,
                    plan.crash.x100() as i64,
                    format_ts(Utc::now()),
                ],
            )?;

            get_round(tx, tx.last_insert_rowid())
        })
    }

    /// Move a round strictly forward. `ended_at` is recorded when entering
    /// CRASHED; `started_at` when entering RUNNING.
    pub fn update_round_status(&self, round_id: i64, status: RoundStatus) -> Result<Round> {
        self.with_tx(|tx| {
            let round = get_round(tx, round_id)?;
            // Re-marking a crashed round crashed is a no-op, so settlement
            // retries stay safe.
            if round.status == RoundStatus::Crashed && status == RoundStatus::Crashed {
                return Ok(round);
            }
            let valid = matches!(
                (round.status, status),
                (RoundStatus::Betting, RoundStatus::Running)
                    | (RoundStatus::Betting, RoundStatus::Crashed)
                    | (RoundStatus::Running, RoundStatus::Crashed)
            );
            if !valid {
                return Err(Error::FailedPrecondition(format!(
                    "round {} cannot move {} -> {}",
                    round.round_number,
                    round.status.as_str(),
                    status.as_str()
                )));
            }

            let now = format_ts(Utc::now());
            match status {
                RoundStatus::Running => {
                    tx.execute(
                        "UPDATE rounds SET status = 'RUNNING', started_at = ?1 WHERE id = ?2",
                        params![now, round_id],
                    )?;
                }
                RoundStatus::Crashed => {
                    tx.execute(
                        "UPDATE rounds SET status = 'CRASHED', ended_at = ?1 WHERE id = ?2",
                        params![now, round_id],
                    )?;
                }
                RoundStatus::Betting => unreachable!("guarded above"),
            }

            get_round(tx, round_id)
        })
    }

    pub fn find_round(&self, round_id: i64) -> Result<Round> {
        self.with_conn(|conn| get_round(conn, round_id))
    }

    /// Highest round number so far; zero on a fresh database. Seeds the
    /// engine's nonce counter at startup.
    pub fn last_round_number(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(round_number), 0) FROM rounds",
                [],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }

    /// Fairness audit feed: the most recent CRASHED rounds, newest first.
    /// Server seeds are withheld (`None`) until `grace_secs` after round end,
    /// so late cashouts cannot be correlated against a known seed.
    pub fn recent_fair_rounds(&self, limit: usize, grace_secs: i64) -> Result<Vec<FairRound>> {
        self.with_conn(|conn| {
            let reveal_cutoff = Utc::now() - Duration::seconds(grace_secs);
            let mut stmt = conn.prepare(
                "SELECT round_number, server_seed, server_seed_hash, client_seed, nonce,
                        crash_x100, ended_at
                 FROM rounds
                 WHERE status = 'CRASHED'
                 ORDER BY round_number DESC
                 LIMIT ?1",
            )?;

            let rows = stmt.query_map(params![limit as i64], |row| {
                let ended_at = parse_opt_ts(6, row.get(6)?)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    ended_at,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (number, seed, hash, client_seed, nonce, crash_x100, ended_at) = row?;
                let revealed = ended_at.map(|at| at <= reveal_cutoff).unwrap_or(false);
                out.push(FairRound {
                    round_number: number,
                    server_seed: if revealed { Some(seed) } else { None },
                    server_seed_hash: hash,
                    client_seed,
                    nonce,
                    crash_point: Multiplier::from_x100(crash_x100 as u64),
                    ended_at,
                });
            }
            Ok(out)
        })
    }

    /// Admin listing with per-round wagering totals, newest first.
    pub fn list_rounds(&self, limit: usize, offset: usize) -> Result<Vec<RoundListEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.round_number, r.crash_x100, r.status, r.ended_at,
                        COUNT(w.id),
                        COALESCE(SUM(w.stake), 0),
                        COALESCE(SUM(w.payout), 0)
                 FROM rounds r
                 LEFT JOIN wagers w ON w.round_id = r.id
                 GROUP BY r.id
                 ORDER BY r.round_number DESC
                 LIMIT ?1 OFFSET ?2",
            )?;

            let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
                let status_str: String = row.get(2)?;
                let status = RoundStatus::parse(&status_str).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        format!("unknown round status '{}'", status_str).into(),
                    )
                })?;
                Ok(RoundListEntry {
                    round_number: row.get(0)?,
                    crash_point: Multiplier::from_x100(row.get::<_, i64>(1)? as u64),
                    status,
                    ended_at: parse_opt_ts(3, row.get(3)?)?,
                    wager_count: row.get(4)?,
                    total_staked: Money::from_minor(row.get(5)?),
                    total_paid: Money::from_minor(row.get(6)?),
                })
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

pub(super) fn get_round(conn: &Connection, id: i64) -> Result<Round> {
    conn.query_row(
        "SELECT id, round_number, server_seed, server_seed_hash, client_seed, nonce,
                crash_x100, status, started_at, ended_at, created_at
         FROM rounds WHERE id = ?1",
        params![id],
        row_to_round,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("round {}", id)))
}

fn row_to_round(row: &rusqlite::Row<'_>) -> rusqlite::Result<Round> {
    let status_str: String = row.get(7)?;
    let status = RoundStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown round status '{}'", status_str).into(),
        )
    })?;

    Ok(Round {
        id: row.get(0)?,
        round_number: row.get(1)?,
        server_seed: row.get(2)?,
        server_seed_hash: row.get(3)?,
        client_seed: row.get(4)?,
        nonce: row.get(5)?,
        crash: Multiplier::from_x100(row.get::<_, i64>(6)? as u64),
        status,
        started_at: parse_opt_ts(8, row.get(8)?)?,
        ended_at: parse_opt_ts(9, row.get(9)?)?,
        created_at: parse_ts(10, &row.get::<_, String>(10)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::new_store;

    fn plan(crash_x100: u64, nonce: u64) -> RoundPlan {
        let seed = "ab".repeat(32);
        RoundPlan {
            server_seed_hash: crate::fairness::seed_hash(&seed),
            server_seed: seed,
            client_seed: String::new(),
            nonce,
            crash: Multiplier::from_x100(crash_x100),
        }
    }

    #[test]
    fn round_numbers_are_monotonic() {
        let store = new_store();

        let first = store.create_round(&plan(150, 1)).unwrap();
        assert_eq!(first.round_number, 1);
        assert_eq!(first.status, RoundStatus::Betting);

        // A second live round is refused while the first is open.
        let err = store.create_round(&plan(200, 2)).unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));

        store
            .update_round_status(first.id, RoundStatus::Running)
            .unwrap();
        store
            .update_round_status(first.id, RoundStatus::Crashed)
            .unwrap();

        let second = store.create_round(&plan(200, 2)).unwrap();
        assert_eq!(second.round_number, 2);
    }

    #[test]
    fn status_moves_strictly_forward() {
        let store = new_store();
        let round = store.create_round(&plan(123, 1)).unwrap();

        let running = store
            .update_round_status(round.id, RoundStatus::Running)
            .unwrap();
        assert!(running.started_at.is_some());

        let crashed = store
            .update_round_status(round.id, RoundStatus::Crashed)
            .unwrap();
        assert!(crashed.ended_at.is_some());

        // Immutable after CRASHED.
        let err = store
            .update_round_status(round.id, RoundStatus::Running)
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
    }

    #[test]
    fn seed_withheld_inside_grace_period() {
        let store = new_store();
        let round = store.create_round(&plan(245, 1)).unwrap();
        store
            .update_round_status(round.id, RoundStatus::Running)
            .unwrap();
        store
            .update_round_status(round.id, RoundStatus::Crashed)
            .unwrap();

        // Just ended: a 5 minute grace hides the seed.
        let hidden = store.recent_fair_rounds(10, 300).unwrap();
        assert_eq!(hidden.len(), 1);
        assert!(hidden[0].server_seed.is_none());
        assert!(!hidden[0].server_seed_hash.is_empty());

        // Zero grace reveals immediately.
        let revealed = store.recent_fair_rounds(10, 0).unwrap();
        assert_eq!(revealed[0].server_seed.as_deref(), Some(&*round.server_seed));
        assert_eq!(revealed[0].crash_point, Multiplier::from_x100(245));
    }

    #[test]
    fn live_rounds_not_in_fair_feed() {
        let store = new_store();
        store.create_round(&plan(150, 1)).unwrap();
        assert!(store.recent_fair_rounds(10, 0).unwrap().is_empty());
    }
}
