//! HTTP route tables (spec.md §6).

mod alerts;
mod channels;
mod credentials;
mod debug;
mod devices;
mod monitors;
mod qr;
mod sensors;
mod vpns;

use crate::state::AppState;
use crate::ws::ws_handler;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/healthz", get(debug::healthz))
        .route("/api/_debug/wg", get(debug::debug_wg))
        .route("/api/_debug/routes", get(debug::debug_routes))
        .route("/api/debug/whoami", get(debug::whoami))
        .route("/api/debug/dump-token", get(debug::dump_token))
        .route("/api/credentials", post(credentials::create).get(credentials::list))
        .route("/api/credentials/:id", delete(credentials::remove))
        .route("/api/devices/manual", post(devices::create_manual))
        .route("/api/devices", get(devices::list))
        .route("/api/devices/search", get(devices::search))
        .route("/api/devices/test_reachability", post(devices::test_reachability))
        .route("/api/devices/:id/promote", put(devices::promote))
        .route("/api/devices/:id/associate_vpn", put(devices::associate_vpn))
        .route("/api/devices/:id", delete(devices::remove))
        .route("/api/monitors", post(monitors::create).get(monitors::list))
        .route("/api/monitors/:id", delete(monitors::remove))
        .route("/api/sensors", post(sensors::create))
        .route("/api/sensors/:id", put(sensors::update).delete(sensors::remove))
        .route("/api/sensors/:id/restart", post(sensors::restart))
        .route("/api/sensors/:id/details", get(sensors::details))
        .route("/api/sensors/:id/history_range", get(sensors::history_range))
        .route("/api/sensors/:id/history_window", get(sensors::history_window))
        .route("/api/channels", post(channels::create).get(channels::list))
        .route("/api/channels/:id", delete(channels::remove))
        .route("/api/channels/telegram/get_chats", post(channels::telegram_get_chats))
        .route("/api/alerts/history", get(alerts::history))
        .route("/api/vpns", post(vpns::create).get(vpns::list))
        .route("/api/vpns/:id", get(vpns::get).put(vpns::update).delete(vpns::remove))
        .route("/api/vpns/mikrotik-auto", post(vpns::mikrotik_auto))
        .route("/api/vpns/peer-status/:pub_key", get(vpns::peer_status_path))
        .route("/api/vpns/peer-status", get(vpns::peer_status_query))
        .route("/api/qr/start", post(qr::start))
        .route("/api/scan/:session_id", post(qr::scan))
        .route("/api/qr/status/:session_id", get(qr::status))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
