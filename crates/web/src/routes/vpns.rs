//! `POST/GET/PUT/DELETE /api/vpns[/id]`, `/api/vpns/mikrotik-auto`, and
//! `/api/vpns/peer-status` (spec.md §6, §4.J).

use crate::state::{AppState, AuthUser};
use axum::extract::{Path, Query, State};
use axum::Json;
use m360_core::peer::{PeerStatus, RegisterPeerRequest, RegisteredPeer};
use m360_common::{Error, Result, VpnProfile};
use m360_core::wgconfig;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateVpnProfile {
    pub name: String,
    pub config_data: String,
    pub check_ip: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

pub async fn create(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Json(body): Json<CreateVpnProfile>) -> Result<Json<VpnProfile>> {
    let parsed = wgconfig::normalize(&body.config_data)?;
    let profile = VpnProfile { id: Uuid::new_v4().to_string(), name: body.name, config_data: parsed.rendered().to_string(), check_ip: body.check_ip, is_default: body.is_default, owner_id };
    app.runtime.store.create_vpn_profile(&profile)?;
    Ok(Json(profile))
}

pub async fn list(State(app): State<AppState>, AuthUser(owner_id): AuthUser) -> Result<Json<Vec<VpnProfile>>> {
    Ok(Json(app.runtime.store.list_vpn_profiles(&owner_id)?))
}

pub async fn get(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<Json<VpnProfile>> {
    Ok(Json(app.runtime.store.get_vpn_profile(&owner_id, &id)?))
}

#[derive(Deserialize)]
pub struct UpdateVpnProfile {
    pub name: String,
    pub config_data: String,
    pub check_ip: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

pub async fn update(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>, Json(body): Json<UpdateVpnProfile>) -> Result<Json<VpnProfile>> {
    let parsed = wgconfig::normalize(&body.config_data)?;
    let profile = VpnProfile { id, name: body.name, config_data: parsed.rendered().to_string(), check_ip: body.check_ip, is_default: body.is_default, owner_id };
    app.runtime.store.update_vpn_profile(&profile)?;
    Ok(Json(profile))
}

pub async fn remove(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<()> {
    app.runtime.store.delete_vpn_profile(&owner_id, &id)
}

#[derive(Deserialize)]
pub struct MikrotikAutoRequest {
    pub device_id: String,
    pub endpoint_host: Option<String>,
    pub endpoint_port: Option<u16>,
    pub dns: Option<String>,
    pub allowed_ips: Option<String>,
}

pub async fn mikrotik_auto(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Json(body): Json<MikrotikAutoRequest>) -> Result<Json<RegisteredPeer>> {
    let req = RegisterPeerRequest {
        device_id: body.device_id,
        owner_id,
        endpoint_host: body.endpoint_host,
        endpoint_port: body.endpoint_port,
        dns: body.dns,
        allowed_ips: body.allowed_ips,
    };
    let peer = app.runtime.peers.register(req).await?;
    Ok(Json(peer))
}

pub async fn peer_status_path(State(app): State<AppState>, _user: AuthUser, Path(pub_key): Path<String>) -> Result<Json<PeerStatus>> {
    Ok(Json(app.runtime.peers.peer_status(&pub_key).await?))
}

#[derive(Deserialize)]
pub struct PeerStatusQuery {
    #[serde(rename = "pub")]
    pub_key: Option<String>,
}

pub async fn peer_status_query(State(app): State<AppState>, _user: AuthUser, Query(q): Query<PeerStatusQuery>) -> Result<Json<PeerStatus>> {
    let pub_key = q.pub_key.ok_or_else(|| Error::InvalidConfig("missing ?pub= query parameter".into()))?;
    Ok(Json(app.runtime.peers.peer_status(&pub_key).await?))
}
