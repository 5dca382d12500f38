//! Route definitions
//!
//! Maps URLs to handlers. Bearer-gated routes get the auth layer; admin
//! routes additionally pass the role and IP gates.

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, put};
use axum::Router;

use super::handlers::{self, admin, auth, fairness, farming, leaderboard, player};
use super::middleware::{require_admin, require_auth};
use super::AppContext;

/// Build the full application router.
pub fn create_router(ctx: AppContext) -> Router {
    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/auth/platform", post(auth::platform_login))
        .route("/api/auth/admin/login", post(auth::admin_login))
        .route("/api/auth/admin/register", post(auth::admin_register))
        .route("/api/auth/refresh", post(auth::refresh))
        .route("/api/fairness/rounds", get(fairness::recent_rounds))
        .route("/api/leaderboard", get(leaderboard::leaderboard))
        // Streaming attach point; token handling happens in the handshake.
        .route("/ws", get(crate::ws::ws_handler));

    let authed = Router::new()
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/profile", get(auth::profile))
        .route("/api/auth/password", post(auth::change_password))
        .route(
            "/api/player/settings",
            get(player::get_settings).put(player::update_settings),
        )
        .route("/api/farming/status", get(farming::status))
        .route("/api/farming/claim", post(farming::claim))
        .route_layer(from_fn_with_state(ctx.clone(), require_auth));

    let admin_routes = Router::new()
        .route("/api/admin/stats", get(admin::stats))
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/users/:id", put(admin::update_user))
        .route("/api/admin/rounds", get(admin::list_rounds))
        // Layer order: auth resolves the identity first, then the role/IP
        // gate inspects it.
        .route_layer(from_fn_with_state(ctx.clone(), require_admin))
        .route_layer(from_fn_with_state(ctx.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(authed)
        .merge(admin_routes)
        .with_state(ctx)
}
