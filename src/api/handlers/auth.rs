//! Authentication routes: platform login, admin password flow, token
//! lifecycle, and profile.

use axum::extract::State;
use axum::{Extension, Json};

use crate::auth::{self, Identity};
use crate::errors::Error;
use crate::store::models::Role;
use crate::store::NewUser;

use super::super::errors::ApiError;
use super::super::middleware::{ClientIp, RequestId};
use super::super::models::{
    AdminLoginRequest, AdminRegisterRequest, ChangePasswordRequest, PlatformLoginRequest,
    ProfileResponse, RefreshRequest, RefreshResponse, TokenResponse,
};
use super::super::rate_limit::LimiterKey;
use super::super::AppContext;

/// POST /api/auth/platform
pub async fn platform_login(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    ClientIp(ip): ClientIp,
    Json(request): Json<PlatformLoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let rid = request_id.0;
    let fail = |e: Error| ApiError::new(rid.clone(), e);

    ctx.limits.auth.check(LimiterKey::Ip(ip)).map_err(&fail)?;

    let platform_identity = auth::verify_platform_payload(
        &ctx.config.platform.secret,
        &request.fields,
        ctx.config.platform.login_max_age_secs,
    )
    .map_err(&fail)?;

    let config = ctx.config.clone();
    let user = ctx
        .store_call(move |store| {
            store.upsert_platform_user(
                &platform_identity.external_id,
                &platform_identity.username,
                config.game.default_balance_money(),
                &config.daily_limits,
            )
        })
        .await
        .map_err(&fail)?;

    if !user.is_active {
        return Err(fail(Error::PermissionDenied(
            "account is deactivated".to_string(),
        )));
    }

    let tokens = ctx.creds.issue(user.id, user.role).map_err(&fail)?;
    let user_id = user.id;
    ctx.store_call(move |store| store.touch_last_login(user_id))
        .await
        .map_err(&fail)?;

    Ok(Json(TokenResponse {
        tokens,
        user: ProfileResponse::from(user),
    }))
}

/// POST /api/auth/admin/login
pub async fn admin_login(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    ClientIp(ip): ClientIp,
    Json(request): Json<AdminLoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let rid = request_id.0;
    let fail = |e: Error| ApiError::new(rid.clone(), e);

    ctx.limits.auth.check(LimiterKey::Ip(ip)).map_err(&fail)?;

    let username = request.username.clone();
    let user = ctx
        .store_call(move |store| store.find_user_by_username(&username))
        .await
        .map_err(&fail)?
        .ok_or_else(|| fail(Error::Unauthenticated))?;

    let stored_hash = user
        .password_hash
        .clone()
        .ok_or_else(|| fail(Error::Unauthenticated))?;
    let password = request.password;
    let verified = tokio::task::spawn_blocking(move || auth::verify_password(&password, &stored_hash))
        .await
        .map_err(|e| fail(Error::internal(format!("hash task panicked: {}", e))))?
        .map_err(&fail)?;
    if !verified {
        return Err(fail(Error::Unauthenticated));
    }

    if user.role != Role::Admin {
        return Err(fail(Error::PermissionDenied(
            "admin role required".to_string(),
        )));
    }
    if !user.is_active {
        return Err(fail(Error::PermissionDenied(
            "account is deactivated".to_string(),
        )));
    }

    let tokens = ctx.creds.issue(user.id, user.role).map_err(&fail)?;
    let user_id = user.id;
    ctx.store_call(move |store| store.touch_last_login(user_id))
        .await
        .map_err(&fail)?;

    Ok(Json(TokenResponse {
        tokens,
        user: ProfileResponse::from(user),
    }))
}

/// POST /api/auth/admin/register
///
/// Gated by the operator's pre-shared key and disabled unless explicitly
/// enabled in configuration.
pub async fn admin_register(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    ClientIp(ip): ClientIp,
    Json(request): Json<AdminRegisterRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let rid = request_id.0;
    let fail = |e: Error| ApiError::new(rid.clone(), e);

    ctx.limits.auth.check(LimiterKey::Ip(ip)).map_err(&fail)?;

    if !ctx.config.admin.registration_enabled {
        return Err(fail(Error::PermissionDenied(
            "admin registration is disabled".to_string(),
        )));
    }
    if ctx.config.admin.registration_key.is_empty()
        || request.registration_key != ctx.config.admin.registration_key
    {
        return Err(fail(Error::PermissionDenied(
            "invalid registration key".to_string(),
        )));
    }
    if request.username.len() < 3 {
        return Err(fail(Error::invalid("username must be at least 3 characters")));
    }
    if request.password.len() < 8 {
        return Err(fail(Error::invalid("password must be at least 8 characters")));
    }

    let password = request.password;
    let password_hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(|e| fail(Error::internal(format!("hash task panicked: {}", e))))?
        .map_err(&fail)?;

    let username = request.username;
    let config = ctx.config.clone();
    let user = ctx
        .store_call(move |store| {
            store.create_user(NewUser {
                username: &username,
                external_id: None,
                role: Role::Admin,
                balance: crate::money::Money::ZERO,
                password_hash: Some(&password_hash),
                daily_defaults: &config.daily_limits,
            })
        })
        .await
        .map_err(&fail)?;

    let tokens = ctx.creds.issue(user.id, user.role).map_err(&fail)?;
    Ok(Json(TokenResponse {
        tokens,
        user: ProfileResponse::from(user),
    }))
}

/// POST /api/auth/refresh
pub async fn refresh(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    ClientIp(ip): ClientIp,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let rid = request_id.0;
    let fail = |e: Error| ApiError::new(rid.clone(), e);

    ctx.limits.auth.check(LimiterKey::Ip(ip)).map_err(&fail)?;

    let access_token = ctx.creds.refresh(&request.refresh_token).map_err(&fail)?;
    Ok(Json(RefreshResponse { access_token }))
}

/// POST /api/auth/logout
pub async fn logout(
    State(ctx): State<AppContext>,
    Extension(identity): Extension<Identity>,
) -> Json<serde_json::Value> {
    ctx.creds.logout(identity.user_id);
    Json(serde_json::json!({ "ok": true }))
}

/// GET /api/auth/profile
pub async fn profile(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let user = ctx
        .store_call(move |store| store.find_user(identity.user_id))
        .await
        .map_err(|e| ApiError::new(request_id.0, e))?;
    Ok(Json(ProfileResponse::from(user)))
}

/// POST /api/auth/password
pub async fn change_password(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rid = request_id.0;
    let fail = |e: Error| ApiError::new(rid.clone(), e);

    if request.new_password.len() < 8 {
        return Err(fail(Error::invalid("password must be at least 8 characters")));
    }

    let user = ctx
        .store_call(move |store| store.find_user(identity.user_id))
        .await
        .map_err(&fail)?;
    let stored_hash = user
        .password_hash
        .ok_or_else(|| fail(Error::FailedPrecondition("no password set".to_string())))?;

    let current = request.current_password;
    let verified = tokio::task::spawn_blocking(move || auth::verify_password(&current, &stored_hash))
        .await
        .map_err(|e| fail(Error::internal(format!("hash task panicked: {}", e))))?
        .map_err(&fail)?;
    if !verified {
        return Err(fail(Error::Unauthenticated));
    }

    let new_password = request.new_password;
    let new_hash = tokio::task::spawn_blocking(move || auth::hash_password(&new_password))
        .await
        .map_err(|e| fail(Error::internal(format!("hash task panicked: {}", e))))?
        .map_err(&fail)?;

    let user_id = identity.user_id;
    ctx.store_call(move |store| store.set_password_hash(user_id, &new_hash))
        .await
        .map_err(&fail)?;

    // Old tokens die with the session.
    ctx.creds.logout(identity.user_id);

    Ok(Json(serde_json::json!({ "ok": true })))
}
