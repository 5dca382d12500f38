//! Player settings routes.

use axum::extract::State;
use axum::{Extension, Json};

use crate::auth::Identity;
use crate::store::SettingsPatch;

use super::super::errors::ApiError;
use super::super::middleware::RequestId;
use super::super::models::{SettingsResponse, SettingsUpdateRequest};
use super::super::rate_limit::LimiterKey;
use super::super::AppContext;

/// GET /api/player/settings
pub async fn get_settings(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let rid = request_id.0;
    ctx.limits
        .settings_read
        .check(LimiterKey::User(identity.user_id))
        .map_err(|e| ApiError::new(rid.clone(), e))?;

    let settings = ctx
        .store_call(move |store| store.get_player_settings(identity.user_id))
        .await
        .map_err(|e| ApiError::new(rid, e))?;
    Ok(Json(SettingsResponse::from(settings)))
}

/// PUT /api/player/settings
pub async fn update_settings(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<SettingsUpdateRequest>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let rid = request_id.0;
    ctx.limits
        .settings_write
        .check(LimiterKey::User(identity.user_id))
        .map_err(|e| ApiError::new(rid.clone(), e))?;

    let patch = SettingsPatch {
        auto_cashout_enabled: request.auto_cashout_enabled,
        auto_cashout: request.auto_cashout,
        sound_enabled: request.sound_enabled,
        daily_limits_enabled: request.daily_limits_enabled,
        max_daily_wager: request.max_daily_wager,
        max_daily_loss: request.max_daily_loss,
        max_games_per_day: request.max_games_per_day,
    };

    let settings = ctx
        .store_call(move |store| store.upsert_player_settings(identity.user_id, patch))
        .await
        .map_err(|e| ApiError::new(rid, e))?;
    Ok(Json(SettingsResponse::from(settings)))
}
