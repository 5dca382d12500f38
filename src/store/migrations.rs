//! Schema migrations, tracked through SQLite's `user_version` pragma.

use rusqlite::Connection;

use crate::errors::Result;

const CURRENT_VERSION: u32 = 1;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::info!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "checking database migrations"
    );

    if current < 1 {
        tracing::info!("applying migration v001_initial");
        v001_initial(conn)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    Ok(())
}

fn v001_initial(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE users (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id        TEXT UNIQUE,
            username           TEXT NOT NULL,
            role               TEXT NOT NULL DEFAULT 'PLAYER',
            balance            INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
            total_wagered      INTEGER NOT NULL DEFAULT 0,
            total_won          INTEGER NOT NULL DEFAULT 0,
            total_lost         INTEGER NOT NULL DEFAULT 0,
            games_played       INTEGER NOT NULL DEFAULT 0,
            biggest_win        INTEGER NOT NULL DEFAULT 0,
            biggest_loss       INTEGER NOT NULL DEFAULT 0,
            xp                 INTEGER NOT NULL DEFAULT 0,
            level              INTEGER NOT NULL DEFAULT 1,
            is_active          INTEGER NOT NULL DEFAULT 1,
            password_hash      TEXT,
            last_farming_claim TEXT,
            created_at         TEXT NOT NULL,
            last_login_at      TEXT
        );

        CREATE UNIQUE INDEX idx_users_username ON users (username);

        CREATE TABLE rounds (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            round_number     INTEGER NOT NULL UNIQUE,
            server_seed      TEXT NOT NULL,
            server_seed_hash TEXT NOT NULL,
            client_seed      TEXT NOT NULL DEFAULT '',
            nonce            INTEGER NOT NULL,
            crash_x100       INTEGER NOT NULL CHECK (crash_x100 >= 100),
            status           TEXT NOT NULL,
            started_at       TEXT,
            ended_at         TEXT,
            created_at       TEXT NOT NULL
        );

        CREATE INDEX idx_rounds_status ON rounds (status);

        CREATE TABLE wagers (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id           INTEGER NOT NULL REFERENCES users (id),
            round_id          INTEGER NOT NULL REFERENCES rounds (id),
            stake             INTEGER NOT NULL CHECK (stake > 0),
            auto_cashout_x100 INTEGER,
            cashout_x100      INTEGER,
            payout            INTEGER,
            status            TEXT NOT NULL DEFAULT 'ACTIVE',
            placed_at         TEXT NOT NULL,
            cashed_out_at     TEXT,
            UNIQUE (user_id, round_id)
        );

        CREATE INDEX idx_wagers_round_status ON wagers (round_id, status);

        CREATE TABLE ledger (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        INTEGER NOT NULL REFERENCES users (id),
            wager_id       INTEGER REFERENCES wagers (id),
            entry_type     TEXT NOT NULL,
            amount         INTEGER NOT NULL CHECK (amount > 0),
            balance_before INTEGER NOT NULL,
            balance_after  INTEGER NOT NULL,
            description    TEXT NOT NULL DEFAULT '',
            created_at     TEXT NOT NULL
        );

        CREATE INDEX idx_ledger_user ON ledger (user_id, id);

        CREATE TABLE player_settings (
            user_id              INTEGER PRIMARY KEY REFERENCES users (id),
            auto_cashout_enabled INTEGER NOT NULL DEFAULT 0,
            auto_cashout_x100    INTEGER,
            sound_enabled        INTEGER NOT NULL DEFAULT 1,
            daily_limits_enabled INTEGER NOT NULL DEFAULT 0,
            max_daily_wager      INTEGER NOT NULL,
            max_daily_loss       INTEGER NOT NULL,
            max_games_per_day    INTEGER NOT NULL
        );

        CREATE TABLE daily_limits (
            user_id INTEGER NOT NULL REFERENCES users (id),
            day     TEXT NOT NULL,
            wagered INTEGER NOT NULL DEFAULT 0,
            lost    INTEGER NOT NULL DEFAULT 0,
            games   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, day)
        );
        ",
    )?;
    Ok(())
}
