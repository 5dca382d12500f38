//! Administrative routes. All gated by role ADMIN (and the optional IP
//! allowlist) in the route layer.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Serialize;

use crate::auth::Identity;
use crate::errors::Error;
use crate::money::Money;
use crate::store::models::LedgerEntryType;
use crate::store::{AdminStats, RoundListEntry, UserPatch};

use super::super::errors::ApiError;
use super::super::middleware::RequestId;
use super::super::models::{AdminUpdateUserRequest, AdminUserRow, PageQuery};
use super::super::rate_limit::LimiterKey;
use super::super::AppContext;

/// GET /api/admin/stats
pub async fn stats(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<AdminStats>, ApiError> {
    let rid = request_id.0;
    ctx.limits
        .admin
        .check(LimiterKey::User(identity.user_id))
        .map_err(|e| ApiError::new(rid.clone(), e))?;

    let stats = ctx
        .store_call(|store| store.admin_stats())
        .await
        .map_err(|e| ApiError::new(rid, e))?;
    Ok(Json(stats))
}

#[derive(Debug, Serialize)]
pub struct AdminUsersResponse {
    pub users: Vec<AdminUserRow>,
}

/// GET /api/admin/users?limit={n}&offset={n}
pub async fn list_users(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
    Query(page): Query<PageQuery>,
) -> Result<Json<AdminUsersResponse>, ApiError> {
    let rid = request_id.0;
    ctx.limits
        .admin
        .check(LimiterKey::User(identity.user_id))
        .map_err(|e| ApiError::new(rid.clone(), e))?;

    let limit = page.limit.clamp(1, 200);
    let offset = page.offset;
    let users = ctx
        .store_call(move |store| store.list_users(limit, offset))
        .await
        .map_err(|e| ApiError::new(rid, e))?;

    Ok(Json(AdminUsersResponse {
        users: users.into_iter().map(AdminUserRow::from).collect(),
    }))
}

/// PUT /api/admin/users/:id
pub async fn update_user(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
    Path(user_id): Path<i64>,
    Json(request): Json<AdminUpdateUserRequest>,
) -> Result<Json<AdminUserRow>, ApiError> {
    let rid = request_id.0;
    let fail = |e: Error| ApiError::new(rid.clone(), e);

    ctx.limits
        .admin
        .check(LimiterKey::User(identity.user_id))
        .map_err(&fail)?;

    // Manual balance corrections are booked through the ledger like any
    // other delta; never written directly.
    if let Some(adjustment) = request.balance_adjustment {
        let amount = Money::parse_amount(adjustment).map_err(&fail)?;
        if amount != Money::ZERO {
            let reason = request
                .adjustment_reason
                .clone()
                .unwrap_or_else(|| "manual adjustment".to_string());
            let balance = ctx
                .store_call(move |store| {
                    store.adjust_balance(
                        user_id,
                        amount,
                        LedgerEntryType::Adjustment,
                        &reason,
                        None,
                    )
                })
                .await
                .map_err(&fail)?;
            ctx.registry
                .set_balance(crate::ws::registry::SessionKey::User(user_id), balance);
        }
    }

    let patch = UserPatch {
        username: request.username,
        role: request.role,
        is_active: request.is_active,
    };
    let user = ctx
        .store_call(move |store| store.update_user(user_id, patch))
        .await
        .map_err(&fail)?;

    Ok(Json(AdminUserRow::from(user)))
}

#[derive(Debug, Serialize)]
pub struct AdminRoundsResponse {
    pub rounds: Vec<RoundListEntry>,
}

/// GET /api/admin/rounds?limit={n}&offset={n}
pub async fn list_rounds(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<Identity>,
    Query(page): Query<PageQuery>,
) -> Result<Json<AdminRoundsResponse>, ApiError> {
    let rid = request_id.0;
    ctx.limits
        .admin
        .check(LimiterKey::User(identity.user_id))
        .map_err(|e| ApiError::new(rid.clone(), e))?;

    let limit = page.limit.clamp(1, 200);
    let offset = page.offset;
    let rounds = ctx
        .store_call(move |store| store.list_rounds(limit, offset))
        .await
        .map_err(|e| ApiError::new(rid, e))?;

    Ok(Json(AdminRoundsResponse { rounds }))
}
