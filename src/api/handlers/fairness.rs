//! Fairness audit feed.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde::Serialize;

use crate::store::models::FairRound;

use super::super::errors::ApiError;
use super::super::middleware::{optional_identity, ClientIp, RequestId};
use super::super::models::LimitQuery;
use super::super::AppContext;

#[derive(Debug, Serialize)]
pub struct FairRoundsResponse {
    pub rounds: Vec<FairRound>,
    /// The derivation parameters an external verifier needs.
    pub house_edge_bps: u32,
}

/// GET /api/fairness/rounds
///
/// Returns the most recent crashed rounds with their committed hashes;
/// server seeds appear only once the reveal grace period has passed.
pub async fn recent_rounds(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<FairRoundsResponse>, ApiError> {
    let rid = request_id.0;
    let identity = optional_identity(&headers, &ctx.creds);
    ctx.limits
        .fairness
        .check(AppContext::limiter_key(identity.as_ref(), ip))
        .map_err(|e| ApiError::new(rid.clone(), e))?;

    let limit = query.limit.clamp(1, 100);
    let grace = ctx.config.fairness.seed_reveal_grace_secs;
    let rounds = ctx
        .store_call(move |store| store.recent_fair_rounds(limit, grace))
        .await
        .map_err(|e| ApiError::new(rid, e))?;

    Ok(Json(FairRoundsResponse {
        rounds,
        house_edge_bps: ctx.config.game.edge_bps,
    }))
}
