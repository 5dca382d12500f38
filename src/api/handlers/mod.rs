//! Route handlers, grouped by surface.

pub mod admin;
pub mod auth;
pub mod fairness;
pub mod farming;
pub mod leaderboard;
pub mod player;

use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "running" })
}
