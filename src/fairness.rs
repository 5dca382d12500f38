//! Provably-fair round material
//!
//! Each round commits to its outcome before betting opens: the oracle draws a
//! random server seed, publishes `SHA-256(serverSeed)` immediately, and keeps
//! the seed itself private until the round has ended and the reveal grace has
//! passed. The crash point is the standard integer-fair derivation over the
//! first 52 bits of `HMAC-SHA-256(serverSeed, clientSeed || nonce)`:
//!
//! ```text
//! crash_x100 = max(100, ((2^52 * (10000 - edge_bps)) / 10000) / (2^52 - X))
//! ```
//!
//! Anyone holding the revealed seed can re-run [`verify_round`] and must
//! obtain both the published hash and the stored crash point.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};
use crate::money::Multiplier;

type HmacSha256 = Hmac<Sha256>;

const FIFTY_TWO_BITS: u128 = 1 << 52;

/// Everything the engine needs to run one committed round.
#[derive(Debug, Clone)]
pub struct RoundPlan {
    /// Hex-encoded 32-byte server seed. Private until reveal.
    pub server_seed: String,
    /// SHA-256 of the hex seed string; public from round creation.
    pub server_seed_hash: String,
    pub client_seed: String,
    pub nonce: u64,
    pub crash: Multiplier,
}

/// Generates per-round seed material and derives crash points.
pub struct Oracle {
    client_seed: String,
    edge_bps: u32,
}

impl Oracle {
    pub fn new(client_seed: String, edge_bps: u32) -> Result<Self> {
        if edge_bps >= 10_000 {
            return Err(Error::invalid("house edge must be below 100%"));
        }
        Ok(Self {
            client_seed,
            edge_bps,
        })
    }

    /// Produce the committed material for the round identified by `nonce`.
    ///
    /// If OS randomness cannot be acquired the oracle refuses to produce a
    /// round; the engine pauses on `FailedPrecondition`.
    pub fn next_round(&self, nonce: u64) -> Result<RoundPlan> {
        let mut seed_bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed_bytes)
            .map_err(|e| Error::FailedPrecondition(format!("randomness unavailable: {}", e)))?;

        let server_seed = hex::encode(seed_bytes);
        let server_seed_hash = seed_hash(&server_seed);
        let crash = derive_crash(&server_seed, &self.client_seed, nonce, self.edge_bps)?;

        Ok(RoundPlan {
            server_seed,
            server_seed_hash,
            client_seed: self.client_seed.clone(),
            nonce,
            crash,
        })
    }
}

/// SHA-256 commitment over the seed's ASCII hex form, so auditors can check
/// it with nothing but `sha256sum`.
pub fn seed_hash(server_seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_seed.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic crash point for a committed seed triple.
pub fn derive_crash(
    server_seed: &str,
    client_seed: &str,
    nonce: u64,
    edge_bps: u32,
) -> Result<Multiplier> {
    let mut mac = HmacSha256::new_from_slice(server_seed.as_bytes())
        .map_err(|e| Error::internal(format!("hmac key: {}", e)))?;
    mac.update(client_seed.as_bytes());
    mac.update(&nonce.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // First 52 bits of the digest.
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let x = u64::from_be_bytes(prefix) >> 12;

    let numerator = FIFTY_TWO_BITS * (10_000 - edge_bps as u128) / 10_000;
    let denominator = FIFTY_TWO_BITS - x as u128;
    let crash_x100 = (numerator / denominator).max(100) as u64;

    Ok(Multiplier::from_x100(crash_x100))
}

/// Public verification: does the revealed seed reproduce both the published
/// hash and the stored crash point?
pub fn verify_round(
    server_seed: &str,
    server_seed_hash: &str,
    client_seed: &str,
    nonce: u64,
    edge_bps: u32,
    expected_crash: Multiplier,
) -> Result<bool> {
    if seed_hash(server_seed) != server_seed_hash {
        return Ok(false);
    }
    let derived = derive_crash(server_seed, client_seed, nonce, edge_bps)?;
    Ok(derived == expected_crash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_matches_revealed_seed() {
        let oracle = Oracle::new(String::new(), 100).unwrap();
        let plan = oracle.next_round(1).unwrap();

        assert_eq!(plan.server_seed.len(), 64);
        assert_eq!(seed_hash(&plan.server_seed), plan.server_seed_hash);
    }

    #[test]
    fn derivation_is_deterministic() {
        let seed = "aa".repeat(32);
        let a = derive_crash(&seed, "client", 7, 100).unwrap();
        let b = derive_crash(&seed, "client", 7, 100).unwrap();
        assert_eq!(a, b);

        // A different nonce gives an independent draw.
        let c = derive_crash(&seed, "client", 8, 100).unwrap();
        // Not a strict inequality in principle, but these fixed inputs differ.
        assert_ne!(a, c);
    }

    #[test]
    fn crash_never_below_one() {
        let seed = "0f".repeat(32);
        for nonce in 0..200 {
            let crash = derive_crash(&seed, "", nonce, 100).unwrap();
            assert!(crash >= Multiplier::ONE, "nonce {} gave {}", nonce, crash);
        }
    }

    #[test]
    fn higher_edge_never_raises_crash() {
        let seed = "3c".repeat(32);
        for nonce in 0..50 {
            let fair = derive_crash(&seed, "", nonce, 0).unwrap();
            let edged = derive_crash(&seed, "", nonce, 500).unwrap();
            assert!(edged <= fair);
        }
    }

    #[test]
    fn verifier_reproduces_oracle_output() {
        let oracle = Oracle::new("public-entropy".to_string(), 100).unwrap();
        let plan = oracle.next_round(42).unwrap();

        assert!(verify_round(
            &plan.server_seed,
            &plan.server_seed_hash,
            &plan.client_seed,
            plan.nonce,
            100,
            plan.crash,
        )
        .unwrap());
    }

    #[test]
    fn verifier_rejects_tampered_material() {
        let oracle = Oracle::new(String::new(), 100).unwrap();
        let plan = oracle.next_round(3).unwrap();

        // Wrong seed.
        let other = "ff".repeat(32);
        assert!(!verify_round(
            &other,
            &plan.server_seed_hash,
            &plan.client_seed,
            plan.nonce,
            100,
            plan.crash,
        )
        .unwrap());

        // Wrong crash point.
        let bumped = Multiplier::from_x100(plan.crash.x100() + 1);
        assert!(!verify_round(
            &plan.server_seed,
            &plan.server_seed_hash,
            &plan.client_seed,
            plan.nonce,
            100,
            bumped,
        )
        .unwrap());
    }

    #[test]
    fn oracle_rejects_degenerate_edge() {
        assert!(Oracle::new(String::new(), 10_000).is_err());
    }
}
