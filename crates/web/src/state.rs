//! Shared application state and the authenticated-tenant extractor.

use crate::auth::jwt::{extract_token, JwtVerifier};
use crate::config::WebConfig;
use crate::ws::Hub;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use m360_core::Runtime;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub config: WebConfig,
    pub jwt: Arc<JwtVerifier>,
    pub hub: Arc<Hub>,
}

/// Every non-public route's `owner_id`, extracted from the verified JWT
/// `sub`. Axum runs this as a handler argument, so a route simply declining
/// to accept it is a public route (spec.md §6's health/debug endpoints).
pub struct AuthUser(pub String);

pub struct AuthError;

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "Unauthorized", "detail": "missing or invalid bearer token"}))).into_response()
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app = AppState::from_ref(state);
        let query = parts.uri.query().and_then(|q| {
            q.split('&').find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k == "token").then(|| v.to_string())
            })
        });
        let cookie = parts
            .headers
            .get(axum::http::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| {
                raw.split(';').map(|p| p.trim()).find_map(|p| p.strip_prefix("sb-access-token=")).map(|v| v.to_string())
            });
        let token = extract_token(&parts.headers, query.as_deref(), cookie.as_deref()).ok_or(AuthError)?;
        let owner_id = app.jwt.verify(&token).await.ok_or(AuthError)?;
        Ok(AuthUser(owner_id))
    }
}
