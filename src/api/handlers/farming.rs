//! Farming reward routes.

use axum::extract::State;
use axum::{Extension, Json};
use serde::Serialize;

use crate::auth::Identity;
use crate::money::Money;
use crate::store::FarmingStatus;

use super::super::errors::ApiError;
use super::super::middleware::RequestId;
use super::super::rate_limit::LimiterKey;
use super::super::AppContext;

/// GET /api/farming/status
pub async fn status(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<FarmingStatus>, ApiError> {
    let rid = request_id.0;
    ctx.limits
        .farming
        .check(LimiterKey::User(identity.user_id))
        .map_err(|e| ApiError::new(rid.clone(), e))?;

    let reward = Money::from_minor(ctx.config.farming.reward);
    let cycle = ctx.config.farming.cycle_secs;
    let status = ctx
        .store_call(move |store| store.farming_status(identity.user_id, reward, cycle))
        .await
        .map_err(|e| ApiError::new(rid, e))?;
    Ok(Json(status))
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub reward: Money,
    pub balance: Money,
}

/// POST /api/farming/claim
pub async fn claim(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let rid = request_id.0;
    ctx.limits
        .farming
        .check(LimiterKey::User(identity.user_id))
        .map_err(|e| ApiError::new(rid.clone(), e))?;

    let reward = Money::from_minor(ctx.config.farming.reward);
    let cycle = ctx.config.farming.cycle_secs;
    let balance = ctx
        .store_call(move |store| store.claim_farming(identity.user_id, reward, cycle))
        .await
        .map_err(|e| ApiError::new(rid, e))?;

    // Keep a connected session's cached balance in step.
    ctx.registry
        .set_balance(crate::ws::registry::SessionKey::User(identity.user_id), balance);

    Ok(Json(ClaimResponse { reward, balance }))
}
