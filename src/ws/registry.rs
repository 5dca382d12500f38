//! Session registry
//!
//! The live set of connected clients, keyed by user id or guest id. Entries
//! hold only transient state: the cached (or, for guests, authoritative
//! virtual) balance and a kill switch used when a second login replaces an
//! older connection. Durable wagers are never touched here; they survive a
//! disconnect.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::money::Money;
use crate::store::models::Role;

/// Identity of one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    User(i64),
    Guest(Uuid),
}

impl SessionKey {
    pub fn user_id(&self) -> Option<i64> {
        match self {
            SessionKey::User(id) => Some(*id),
            SessionKey::Guest(_) => None,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, SessionKey::Guest(_))
    }
}

pub struct SessionEntry {
    pub key: SessionKey,
    pub role: Role,
    /// Cached balance for authenticated users; the authoritative virtual
    /// balance for guests.
    pub balance: Money,
    /// Distinguishes this connection from a replacement with the same key.
    pub conn_id: u64,
    /// Flipped to true when a newer connection takes over.
    kill: watch::Sender<bool>,
}

/// Handle a connection task holds onto after attaching.
pub struct Attachment {
    pub conn_id: u64,
    pub killed: watch::Receiver<bool>,
}

static CONN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Concurrent map of live sessions. Attach/detach are short critical
/// sections on the shard holding the key.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. A second connection for the same authenticated
    /// user replaces the older one, which is told to close gracefully.
    pub fn attach(&self, key: SessionKey, role: Role, balance: Money) -> Attachment {
        let conn_id = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, killed) = watch::channel(false);

        let entry = SessionEntry {
            key,
            role,
            balance,
            conn_id,
            kill: kill_tx,
        };

        if let Some(previous) = self.sessions.insert(key, entry) {
            tracing::info!(?key, "replacing existing session");
            let _ = previous.kill.send(true);
        }

        Attachment { conn_id, killed }
    }

    /// Remove a session, but only if it still belongs to this connection;
    /// a replaced connection must not evict its replacement.
    pub fn detach(&self, key: SessionKey, conn_id: u64) {
        self.sessions.remove_if(&key, |_, entry| entry.conn_id == conn_id);
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn balance(&self, key: SessionKey) -> Option<Money> {
        self.sessions.get(&key).map(|entry| entry.balance)
    }

    /// Refresh a cached balance after a store-confirmed mutation.
    pub fn set_balance(&self, key: SessionKey, balance: Money) {
        if let Some(mut entry) = self.sessions.get_mut(&key) {
            entry.balance = balance;
        }
    }

    /// Debit a guest's virtual balance; the registry is the authority for
    /// guest funds.
    pub fn debit_guest(&self, key: SessionKey, amount: Money) -> Result<Money> {
        let mut entry = self
            .sessions
            .get_mut(&key)
            .ok_or(Error::Unauthenticated)?;
        let after = entry
            .balance
            .checked_sub(amount)
            .ok_or_else(|| Error::internal("balance overflow"))?;
        if after.is_negative() {
            return Err(Error::InsufficientFunds);
        }
        entry.balance = after;
        Ok(after)
    }

    pub fn credit_guest(&self, key: SessionKey, amount: Money) -> Result<Money> {
        let mut entry = self
            .sessions
            .get_mut(&key)
            .ok_or(Error::Unauthenticated)?;
        let after = entry
            .balance
            .checked_add(amount)
            .ok_or_else(|| Error::internal("balance overflow"))?;
        entry.balance = after;
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new()
    }

    #[test]
    fn attach_detach_round_trip() {
        let reg = registry();
        let key = SessionKey::Guest(Uuid::new_v4());

        let attachment = reg.attach(key, Role::Player, Money::from_major(100));
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.balance(key), Some(Money::from_major(100)));

        reg.detach(key, attachment.conn_id);
        assert_eq!(reg.count(), 0);
        assert_eq!(reg.balance(key), None);
    }

    #[test]
    fn second_login_replaces_and_kills_first() {
        let reg = registry();
        let key = SessionKey::User(7);

        let first = reg.attach(key, Role::Player, Money::ZERO);
        let second = reg.attach(key, Role::Player, Money::ZERO);
        assert_eq!(reg.count(), 1);

        // The first connection was told to die.
        assert!(*first.killed.borrow());
        assert!(!*second.killed.borrow());

        // A stale detach from the replaced connection is a no-op.
        reg.detach(key, first.conn_id);
        assert_eq!(reg.count(), 1);

        reg.detach(key, second.conn_id);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn guest_balance_is_authoritative_here() {
        let reg = registry();
        let key = SessionKey::Guest(Uuid::new_v4());
        reg.attach(key, Role::Player, Money::from_major(50));

        let after = reg.debit_guest(key, Money::from_major(20)).unwrap();
        assert_eq!(after, Money::from_major(30));

        let err = reg.debit_guest(key, Money::from_major(31)).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds));
        assert_eq!(reg.balance(key), Some(Money::from_major(30)));

        let after = reg.credit_guest(key, Money::from_major(45)).unwrap();
        assert_eq!(after, Money::from_major(75));
    }

    #[test]
    fn session_key_helpers() {
        assert_eq!(SessionKey::User(3).user_id(), Some(3));
        let guest = SessionKey::Guest(Uuid::new_v4());
        assert_eq!(guest.user_id(), None);
        assert!(guest.is_guest());
    }
}
