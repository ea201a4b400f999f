use std::sync::Arc;

use m360_core::{Config, Runtime};
use m360_web::config::WebConfig;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let core_config = Config::from_env();
    let web_config = WebConfig::from_env()?;
    let addr: std::net::SocketAddr = web_config.bind_addr.parse()?;

    let runtime = Arc::new(Runtime::new(core_config, None).await?);
    runtime.start().await?;
    info!("sensor scheduler started");

    let app = m360_web::app(runtime.clone(), web_config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "m360-web listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    // The router (and every clone of `Arc<Runtime>` it handed to request
    // handlers) is dropped once `axum::serve` resolves, so this is the
    // only outstanding reference left — `Runtime::shutdown` needs `self`
    // to tear down every VPN tunnel unconditionally (spec.md §5).
    match Arc::try_unwrap(runtime) {
        Ok(rt) => rt.shutdown().await,
        Err(_) => warn!("runtime still has outstanding references after shutdown; skipping vpn teardown"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
