//! Leaderboard route.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde::Serialize;

use crate::errors::Error;
use crate::store::{LeaderboardEntry, LeaderboardSort};

use super::super::errors::ApiError;
use super::super::middleware::{optional_identity, ClientIp, RequestId};
use super::super::models::LeaderboardQuery;
use super::super::AppContext;

#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub sort: String,
    pub entries: Vec<LeaderboardEntry>,
}

/// GET /api/leaderboard?sort={balance|totalWon|winRate|level}&limit={n}
pub async fn leaderboard(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    let rid = request_id.0;
    let identity = optional_identity(&headers, &ctx.creds);
    ctx.limits
        .leaderboard
        .check(AppContext::limiter_key(identity.as_ref(), ip))
        .map_err(|e| ApiError::new(rid.clone(), e))?;

    let sort = LeaderboardSort::parse(&query.sort).ok_or_else(|| {
        ApiError::new(
            rid.clone(),
            Error::invalid_with(
                "unknown sort key",
                vec!["sort must be one of balance, totalWon, winRate, level".to_string()],
            ),
        )
    })?;

    let limit = query.limit.clamp(1, 100);
    let min_games = ctx.config.limits.leaderboard_min_games;
    let entries = ctx
        .store_call(move |store| store.leaderboard(sort, limit, min_games))
        .await
        .map_err(|e| ApiError::new(rid, e))?;

    Ok(Json(LeaderboardResponse {
        sort: query.sort,
        entries,
    }))
}
