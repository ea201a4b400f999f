//! Health and debug endpoints (spec.md §6).

use crate::state::{AppState, AuthUser};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub async fn debug_wg(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(app.runtime.vpn.debug_snapshot())
}

pub async fn debug_routes(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "known_routeros_sessions": app.runtime.ros.known_ips(),
        "running_sensors": app.runtime.scheduler.running_sensor_ids(),
    }))
}

pub async fn whoami(AuthUser(owner_id): AuthUser) -> Json<serde_json::Value> {
    Json(json!({"owner_id": owner_id}))
}

/// Decodes (without verifying) whatever bearer token is presented, for
/// local debugging of claims shape. Never used for authorization.
pub async fn dump_token(headers: HeaderMap) -> Json<serde_json::Value> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token.and_then(crate::auth::jwt::unsafe_decode_payload) {
        Some(payload) => Json(payload),
        None => Json(json!({"error": "no bearer token presented"})),
    }
}
