//! Persistence gateway
//!
//! The only component that touches durable state. Exposes typed operations;
//! every mutating operation runs inside a single SQLite transaction, so a
//! balance update and its ledger row either both land or neither does.
//! Transient busy errors map to `DeadlineExceeded` and are retried once.

pub mod migrations;
pub mod models;

mod rounds;
mod settings;
mod users;
mod wagers;

pub use rounds::RoundListEntry;
pub use settings::SettingsPatch;
pub use users::{
    AdminStats, FarmingStatus, LeaderboardEntry, LeaderboardSort, NewUser, UserPatch,
};
pub use wagers::{PlacedWager, SettledWager};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;

use crate::errors::{Error, Result};

/// Handle to the durable store. Cheap to share behind an `Arc`; all access
/// serializes on an internal connection lock, and callers in async context
/// go through `spawn_blocking`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening game database");
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read-only operation against the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| Error::internal("store lock poisoned"))?;
        f(&guard)
    }

    /// Run a mutating operation inside one immediate transaction. Transient
    /// failures (`DeadlineExceeded`) retry exactly once; hard kinds do not.
    pub(crate) fn with_tx<T>(
        &self,
        mut f: impl FnMut(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::internal("store lock poisoned"))?;

        let mut retried = false;
        loop {
            let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = f(&tx).and_then(|value| {
                tx.commit()?;
                Ok(value)
            });
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && !retried => {
                    tracing::warn!(error = %e, "transient store failure, retrying once");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Timestamps are stored as RFC 3339 text.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn parse_opt_ts(
    column: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(column, &v)).transpose()
}

/// Calendar-day key for daily limit counters.
pub(crate) fn day_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}
