//! `POST/GET/DELETE /api/credentials[/id]` (spec.md §6).

use crate::state::{AppState, AuthUser};
use axum::extract::{Path, State};
use axum::Json;
use m360_common::{Credential, Error, Result};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateCredential {
    pub name: String,
    pub username: String,
    pub password: String,
}

pub async fn create(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Json(body): Json<CreateCredential>) -> Result<Json<Credential>> {
    if body.name.trim().is_empty() || body.username.trim().is_empty() {
        return Err(Error::InvalidConfig("name and username are required".into()));
    }
    let cred = Credential { id: Uuid::new_v4().to_string(), name: body.name, username: body.username, password: body.password, owner_id };
    app.runtime.store.create_credential(&cred)?;
    Ok(Json(cred))
}

pub async fn list(State(app): State<AppState>, AuthUser(owner_id): AuthUser) -> Result<Json<Vec<Credential>>> {
    Ok(Json(app.runtime.store.list_credentials(&owner_id)?))
}

pub async fn remove(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<()> {
    app.runtime.store.delete_credential(&owner_id, &id)
}
