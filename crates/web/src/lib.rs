//! HTTP/WebSocket surface (component G) for the multi-tenant RouterOS
//! monitoring backend. Wraps `m360_core::Runtime` in an axum app: JWT
//! verification, the route handlers of spec.md §6, and the WS fan-out of
//! spec.md §4.G.

pub mod auth;
pub mod config;
pub mod routes;
pub mod state;
pub mod ws;

use config::WebConfig;
use m360_core::Runtime;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Builds the axum `Router` and spawns the event-bus-to-WS bridge task
/// that drains `runtime.events` into the fan-out `Hub`.
pub fn app(runtime: Arc<Runtime>, config: WebConfig) -> axum::Router {
    let jwt = auth::JwtVerifier::new(config.jwt.clone());
    let hub = ws::Hub::new(runtime.store.clone());

    let mut events = runtime.events.subscribe();
    let bridge_hub = hub.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => bridge_hub.broadcast(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "ws fan-out lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let state = AppState { runtime, config, jwt, hub };
    routes::build(state)
}

pub async fn serve(addr: SocketAddr, runtime: Arc<Runtime>, config: WebConfig) -> anyhow::Result<()> {
    let app = app(runtime, config);
    info!(%addr, "m360-web listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
