//! Request front-end
//!
//! Validates inputs, enforces per-route rate limits, and delegates to the
//! credential service, persistence gateway, and round engine. No game logic
//! lives here.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod routes;

use std::net::IpAddr;
use std::sync::Arc;

use crate::auth::{CredentialService, Identity};
use crate::config::RedlineConfig;
use crate::engine::EngineHandle;
use crate::errors::{Error, Result};
use crate::store::Store;
use crate::ws::registry::SessionRegistry;

use self::rate_limit::{LimiterKey, RateLimiters};

/// Shared application state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<RedlineConfig>,
    pub store: Arc<Store>,
    pub creds: Arc<CredentialService>,
    pub registry: Arc<SessionRegistry>,
    pub engine: EngineHandle,
    pub limits: Arc<RateLimiters>,
}

/// Per-call deadline for persistence operations.
pub const STORE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

impl AppContext {
    /// Run a persistence call off the async worker threads, bounded by the
    /// per-call deadline.
    pub async fn store_call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || f(&store));
        match tokio::time::timeout(STORE_DEADLINE, task).await {
            Err(_) => Err(Error::DeadlineExceeded),
            Ok(join) => {
                join.map_err(|e| Error::internal(format!("persistence task panicked: {}", e)))?
            }
        }
    }

    /// Rate-limit key: user id when authenticated, caller IP otherwise.
    pub fn limiter_key(identity: Option<&Identity>, ip: IpAddr) -> LimiterKey {
        match identity {
            Some(identity) => LimiterKey::User(identity.user_id),
            None => LimiterKey::Ip(ip),
        }
    }
}
