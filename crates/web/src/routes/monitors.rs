//! `POST/GET/DELETE /api/monitors[/id]` (spec.md §6).

use crate::state::{AppState, AuthUser};
use axum::extract::{Path, State};
use axum::Json;
use m360_common::{Error, Monitor, Result};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateMonitor {
    pub device_id: String,
}

pub async fn create(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Json(body): Json<CreateMonitor>) -> Result<Json<Monitor>> {
    // Validates the device is this tenant's before binding a monitor to it.
    app.runtime.store.get_device(&owner_id, &body.device_id).map_err(|_| Error::NotFound { kind: "device".into(), id: body.device_id.clone() })?;
    let monitor = Monitor { id: Uuid::new_v4().to_string(), device_id: body.device_id, owner_id };
    app.runtime.store.create_monitor(&monitor)?;
    Ok(Json(monitor))
}

pub async fn list(State(app): State<AppState>, AuthUser(owner_id): AuthUser) -> Result<Json<Vec<Monitor>>> {
    Ok(Json(app.runtime.store.list_monitors(&owner_id)?))
}

pub async fn remove(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<()> {
    app.runtime.store.delete_monitor(&owner_id, &id)
}
