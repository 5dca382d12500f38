//! Cross-cutting request middleware: request ids, CORS, client IP
//! resolution, and the bearer-token gates.

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::{request::Parts, HeaderMap, HeaderName, Method};
use axum::middleware::Next;
use axum::response::Response;
use std::net::{IpAddr, SocketAddr};
use tower_http::cors::{Any, CorsLayer, ExposeHeaders};
use uuid::Uuid;

use crate::errors::Error;
use crate::store::models::Role;

use super::errors::ApiError;
use super::AppContext;

/// Request ID header key.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request ID wrapper for extraction in handlers.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Attach a request id (client-provided or generated) to the request
/// extensions and echo it on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = request_id.parse() {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Create the CORS layer from the configured origins.
pub fn create_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(ExposeHeaders::list([HeaderName::from_static(
                REQUEST_ID_HEADER,
            )]))
    } else {
        CorsLayer::new()
            .allow_origin(
                allowed_origins
                    .iter()
                    .filter_map(|o| o.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers(Any)
            .expose_headers(ExposeHeaders::list([HeaderName::from_static(
                REQUEST_ID_HEADER,
            )]))
    }
}

/// Resolve the caller IP, honouring proxy headers before the socket address.
pub fn extract_client_ip(headers: &HeaderMap, connect_info: Option<SocketAddr>) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return ip;
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.parse() {
                return ip;
            }
        }
    }

    connect_info
        .map(|addr| addr.ip())
        .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
}

/// Extractor for the resolved client IP.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let connect_info = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        Ok(ClientIp(extract_client_ip(&parts.headers, connect_info)))
    }
}

fn request_id_of(request: &Request) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Optional authentication: resolve an identity when a valid token is
/// present, without rejecting anonymous callers. Public routes use this to
/// key their rate limits by user where possible.
pub fn optional_identity(
    headers: &HeaderMap,
    creds: &crate::auth::CredentialService,
) -> Option<crate::auth::Identity> {
    bearer_token(headers).and_then(|token| creds.validate_access(token).ok())
}

/// Gate: a valid access token is required. The resolved identity lands in
/// the request extensions.
pub async fn require_auth(
    State(ctx): State<AppContext>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = request_id_of(&request);

    let token = bearer_token(request.headers())
        .ok_or_else(|| ApiError::new(request_id.clone(), Error::Unauthenticated))?;
    let identity = ctx
        .creds
        .validate_access(token)
        .map_err(|e| ApiError::new(request_id.clone(), e))?;

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Gate: ADMIN role, plus the operator IP allowlist when one is configured.
/// Layered after [`require_auth`].
pub async fn require_admin(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = request_id_of(&request);

    let identity = request
        .extensions()
        .get::<crate::auth::Identity>()
        .copied()
        .ok_or_else(|| ApiError::new(request_id.clone(), Error::Unauthenticated))?;
    if identity.role != Role::Admin {
        return Err(ApiError::new(
            request_id,
            Error::PermissionDenied("admin role required".to_string()),
        ));
    }

    let allowlist = &ctx.config.admin.ip_allowlist;
    if !allowlist.is_empty() {
        let connect_info = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        let ip = extract_client_ip(request.headers(), connect_info);
        if !allowlist.contains(&ip) {
            return Err(ApiError::new(
                request_id,
                Error::PermissionDenied(format!("ip {} not allowlisted", ip)),
            ));
        }
    }

    Ok(next.run(request).await)
}
