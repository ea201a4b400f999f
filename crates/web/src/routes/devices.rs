//! Device CRUD, promotion, VPN association, and the reachability probe
//! (spec.md §6, §4.H).

use crate::state::{AppState, AuthUser};
use axum::extract::{Path, Query, State};
use axum::Json;
use m360_common::{Device, Error, Result};
use m360_core::{ReachabilityRequest, ReachabilityResult};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateDevice {
    pub client_name: String,
    pub ip_address: String,
    pub node: Option<String>,
    pub mac: Option<String>,
    pub credential_id: Option<String>,
}

pub async fn create_manual(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Json(body): Json<CreateDevice>) -> Result<Json<Device>> {
    if body.ip_address.trim().is_empty() || body.client_name.trim().is_empty() {
        return Err(Error::InvalidConfig("client_name and ip_address are required".into()));
    }
    let device = Device {
        id: Uuid::new_v4().to_string(),
        client_name: body.client_name,
        ip_address: body.ip_address,
        node: body.node,
        mac: body.mac,
        status: "unknown".to_string(),
        credential_id: body.credential_id,
        is_maestro: false,
        maestro_id: None,
        vpn_profile_id: None,
        owner_id,
        last_auth_ok: None,
        last_auth_fail: None,
        rotations_count: 0,
        wg_address: None,
    };
    app.runtime.store.create_device(&device)?;
    Ok(Json(device))
}

pub async fn list(State(app): State<AppState>, AuthUser(owner_id): AuthUser) -> Result<Json<Vec<Device>>> {
    Ok(Json(app.runtime.store.list_devices(&owner_id)?))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    search: Option<String>,
}

pub async fn search(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Query(q): Query<SearchQuery>) -> Result<Json<Vec<Device>>> {
    let term = q.search.unwrap_or_default();
    Ok(Json(app.runtime.store.search_devices(&owner_id, &term)?))
}

pub async fn promote(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<()> {
    app.runtime.store.promote_device(&owner_id, &id)
}

#[derive(Deserialize)]
pub struct AssociateVpn {
    pub maestro_id: Option<String>,
    pub vpn_profile_id: Option<String>,
}

pub async fn associate_vpn(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>, Json(body): Json<AssociateVpn>) -> Result<()> {
    app.runtime.store.associate_vpn(&owner_id, &id, body.maestro_id.as_deref(), body.vpn_profile_id.as_deref())
}

pub async fn remove(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<()> {
    app.runtime.store.delete_device(&owner_id, &id)
}

#[derive(Deserialize)]
pub struct TestReachability {
    pub ip: String,
    pub vpn_profile_id: Option<String>,
    pub maestro_id: Option<String>,
}

pub async fn test_reachability(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Json(body): Json<TestReachability>) -> Result<Json<ReachabilityResult>> {
    let req = ReachabilityRequest { ip: body.ip, vpn_profile_id: body.vpn_profile_id, maestro_id: body.maestro_id };
    let result = app.runtime.reachability.probe(&owner_id, req).await?;
    Ok(Json(result))
}

