//! QR device-pairing endpoints (spec.md §3 `SCAN_SESSIONS`, §6).
//!
//! A tenant starts a session (`/api/qr/start`), renders it as a QR code
//! client-side, a paired device or companion app posts the device id it
//! found to `/api/scan/{session_id}`, and the original caller polls
//! `/api/qr/status/{session_id}` until it's claimed. Sessions expire after
//! 300s (spec.md §5).

use crate::state::{AppState, AuthUser};
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use m360_common::{Error, Result, ScanSession};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const SESSION_TTL_SECS: i64 = 300;

pub async fn start(State(app): State<AppState>, AuthUser(owner_id): AuthUser) -> Result<Json<serde_json::Value>> {
    let session = ScanSession { session_id: Uuid::new_v4().to_string(), owner_id, created_at: Utc::now().timestamp(), claimed_device_id: None };
    app.runtime.store.create_scan_session(&session)?;
    Ok(Json(json!({"session_id": session.session_id, "expires_in": SESSION_TTL_SECS})))
}

#[derive(Deserialize)]
pub struct ScanRequest {
    pub device_id: String,
}

pub async fn scan(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(session_id): Path<String>, Json(body): Json<ScanRequest>) -> Result<Json<serde_json::Value>> {
    let session = app
        .runtime
        .store
        .get_scan_session(&session_id)?
        .ok_or_else(|| Error::NotFound { kind: "scan_session".into(), id: session_id.clone() })?;
    if session.owner_id != owner_id {
        return Err(Error::Unauthorized("scan session belongs to a different tenant".into()));
    }
    if Utc::now().timestamp() - session.created_at > SESSION_TTL_SECS {
        app.runtime.store.delete_scan_session(&session_id)?;
        return Err(Error::NotFound { kind: "scan_session".into(), id: session_id });
    }
    app.runtime.store.get_device(&owner_id, &body.device_id)?;
    app.runtime.store.claim_scan_session(&session_id, &body.device_id)?;
    Ok(Json(json!({"claimed": true})))
}

pub async fn status(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(session_id): Path<String>) -> Result<Json<serde_json::Value>> {
    let session = app
        .runtime
        .store
        .get_scan_session(&session_id)?
        .ok_or_else(|| Error::NotFound { kind: "scan_session".into(), id: session_id.clone() })?;
    if session.owner_id != owner_id {
        return Err(Error::Unauthorized("scan session belongs to a different tenant".into()));
    }
    let expired = Utc::now().timestamp() - session.created_at > SESSION_TTL_SECS;
    if expired {
        app.runtime.store.delete_scan_session(&session_id)?;
    }
    Ok(Json(json!({
        "session_id": session.session_id,
        "expired": expired,
        "claimed_device_id": session.claimed_device_id,
    })))
}
