//! Credential service
//!
//! Issues and validates bearer tokens signed with a symmetric secret
//! (HMAC-SHA-256 over hex-encoded JSON claims), tracks one live session per
//! user, and validates external messaging-platform login payloads.
//!
//! Token layout: `hex(claims_json) . hex(hmac_sha256(secret, hex(claims_json)))`.

use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TokenConfig;
use crate::errors::{Error, Result};
use crate::store::models::Role;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    role: Role,
    typ: TokenType,
    iat: i64,
    exp: i64,
}

/// Resolved caller identity attached to requests.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: i64,
    pub role: Role,
}

/// Access and refresh token pair returned on login.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

struct LiveSession {
    /// SHA-256 of the most recent access token; older tokens are rejected.
    access_fingerprint: [u8; 32],
    last_activity: i64,
}

/// Issues tokens and tracks the single live session per user.
pub struct CredentialService {
    secret: Vec<u8>,
    access_ttl: i64,
    refresh_ttl: i64,
    session_idle: i64,
    sessions: DashMap<i64, LiveSession>,
}

impl CredentialService {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            secret: config.secret.as_bytes().to_vec(),
            access_ttl: config.access_ttl_secs,
            refresh_ttl: config.refresh_ttl_secs,
            session_idle: config.session_idle_secs,
            sessions: DashMap::new(),
        }
    }

    /// Issue a fresh token pair and (re)register the user's session.
    pub fn issue(&self, user_id: i64, role: Role) -> Result<TokenPair> {
        let now = Utc::now().timestamp();
        let access = self.sign_claims(&Claims {
            sub: user_id,
            role,
            typ: TokenType::Access,
            iat: now,
            exp: now + self.access_ttl,
        })?;
        let refresh = self.sign_claims(&Claims {
            sub: user_id,
            role,
            typ: TokenType::Refresh,
            iat: now,
            exp: now + self.refresh_ttl,
        })?;

        self.sessions.insert(
            user_id,
            LiveSession {
                access_fingerprint: fingerprint(&access),
                last_activity: now,
            },
        );

        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
        })
    }

    /// Validate an access token: signature, expiry, type, and session
    /// fingerprint. Bumps the session's activity clock on success.
    pub fn validate_access(&self, token: &str) -> Result<Identity> {
        let claims = self.verify_token(token)?;
        if claims.typ != TokenType::Access {
            return Err(Error::Unauthenticated);
        }

        let now = Utc::now().timestamp();
        let mut session = self
            .sessions
            .get_mut(&claims.sub)
            .ok_or(Error::Unauthenticated)?;
        if session.access_fingerprint != fingerprint(token) {
            return Err(Error::Unauthenticated);
        }
        session.last_activity = now;

        Ok(Identity {
            user_id: claims.sub,
            role: claims.role,
        })
    }

    /// Exchange a refresh token for a new access token. Requires a live
    /// session: after `logout` the same refresh token is useless.
    pub fn refresh(&self, refresh_token: &str) -> Result<String> {
        let claims = self.verify_token(refresh_token)?;
        if claims.typ != TokenType::Refresh {
            return Err(Error::Unauthenticated);
        }

        let now = Utc::now().timestamp();
        let mut session = self
            .sessions
            .get_mut(&claims.sub)
            .ok_or(Error::Unauthenticated)?;

        let access = self.sign_claims(&Claims {
            sub: claims.sub,
            role: claims.role,
            typ: TokenType::Access,
            iat: now,
            exp: now + self.access_ttl,
        })?;
        session.access_fingerprint = fingerprint(&access);
        session.last_activity = now;

        Ok(access)
    }

    pub fn logout(&self, user_id: i64) {
        self.sessions.remove(&user_id);
    }

    /// Drop sessions idle beyond the configured threshold. Returns how many
    /// were removed.
    pub fn reap_idle(&self) -> usize {
        let cutoff = Utc::now().timestamp() - self.session_idle;
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.last_activity >= cutoff);
        before - self.sessions.len()
    }

    /// Periodic reaper for expired sessions.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                interval.tick().await;
                let reaped = service.reap_idle();
                if reaped > 0 {
                    tracing::info!(reaped, "reaped idle sessions");
                }
            }
        });
    }

    fn sign_claims(&self, claims: &Claims) -> Result<String> {
        let payload = hex::encode(serde_json::to_vec(claims)?);
        let tag = self.mac(payload.as_bytes())?;
        Ok(format!("{}.{}", payload, hex::encode(tag)))
    }

    fn verify_token(&self, token: &str) -> Result<Claims> {
        let (payload, tag_hex) = token.split_once('.').ok_or(Error::Unauthenticated)?;
        let tag = hex::decode(tag_hex).map_err(|_| Error::Unauthenticated)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::internal(format!("hmac key: {}", e)))?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&tag).map_err(|_| Error::Unauthenticated)?;

        let claims_json = hex::decode(payload).map_err(|_| Error::Unauthenticated)?;
        let claims: Claims =
            serde_json::from_slice(&claims_json).map_err(|_| Error::Unauthenticated)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(Error::Unauthenticated);
        }
        Ok(claims)
    }

    fn mac(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::internal(format!("hmac key: {}", e)))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn fingerprint(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Identity fields extracted from a validated platform login payload.
#[derive(Debug, Clone)]
pub struct PlatformIdentity {
    pub external_id: String,
    pub username: String,
}

/// Validate a signed login payload from the external messaging platform.
///
/// The payload carries identity fields plus a `hash`; the expected value is
/// `HMAC-SHA-256(key = SHA-256(platform_secret), msg = data-check-string)`
/// where the data-check-string is the remaining fields as sorted `k=v` lines.
/// Payloads older than `max_age_secs` are rejected.
pub fn verify_platform_payload(
    platform_secret: &str,
    fields: &BTreeMap<String, String>,
    max_age_secs: i64,
) -> Result<PlatformIdentity> {
    if platform_secret.is_empty() {
        return Err(Error::FailedPrecondition(
            "platform login is not configured".to_string(),
        ));
    }

    let provided_hash = fields
        .get("hash")
        .ok_or_else(|| Error::invalid("missing field 'hash'"))?;

    // BTreeMap iteration is already sorted by key.
    let data_check_string = fields
        .iter()
        .filter(|(k, _)| k.as_str() != "hash")
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");

    let mut key_hasher = Sha256::new();
    key_hasher.update(platform_secret.as_bytes());
    let key = key_hasher.finalize();

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| Error::internal(format!("hmac key: {}", e)))?;
    mac.update(data_check_string.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if &expected != provided_hash {
        return Err(Error::Unauthenticated);
    }

    let auth_date: i64 = fields
        .get("auth_date")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::invalid("missing or malformed 'auth_date'"))?;
    if Utc::now().timestamp() - auth_date > max_age_secs {
        return Err(Error::Unauthenticated);
    }

    let external_id = fields
        .get("id")
        .cloned()
        .ok_or_else(|| Error::invalid("missing field 'id'"))?;
    let username = fields
        .get("username")
        .or_else(|| fields.get("first_name"))
        .cloned()
        .unwrap_or_else(|| format!("player-{}", external_id));

    Ok(PlatformIdentity {
        external_id,
        username,
    })
}

/// Argon2id hash for admin passwords.
pub fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::internal(format!("password hashing failed: {}", e)))
}

pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool> {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};
    use argon2::Argon2;

    let parsed = PasswordHash::new(stored_hash)
        .map_err(|e| Error::internal(format!("stored hash malformed: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
