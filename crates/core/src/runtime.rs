//! Wires components A-J into the single long-running service spec.md §5
//! describes: one Tokio runtime, shared `Arc`-guarded state, no process
//! boundary between the scheduler and the HTTP surface.

use crate::alert::{AlertEngine, Notifier, NullNotifier};
use crate::config::Config;
use crate::events::EventBus;
use crate::netadmin::{NetAdmin, ShellNetAdmin};
use crate::peer::PeerRegistrar;
use crate::reachability::ReachabilityProbe;
use crate::ros::{BlockingRouterOsConnector, RouterOsConnector, RouterOsPool};
use crate::rotation::CredentialRotator;
use crate::scheduler::{self, SensorScheduler};
use crate::vpn::VpnManager;
use m360_common::{Database, Result, Store};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a running instance needs, constructed once at startup and
/// handed to the HTTP surface by reference/clone.
pub struct Runtime {
    pub store: Store,
    pub config: Config,
    pub vpn: Arc<VpnManager>,
    pub ros: Arc<RouterOsPool>,
    pub rotator: Arc<CredentialRotator>,
    pub alerts: Arc<AlertEngine>,
    pub events: EventBus,
    pub scheduler: Arc<SensorScheduler>,
    pub reachability: Arc<ReachabilityProbe>,
    pub peers: Arc<PeerRegistrar>,
    keepalive_cancel: CancellationToken,
    keepalive_handle: JoinHandle<()>,
}

impl Runtime {
    /// Builds every component and starts the keepalive loop, but does NOT
    /// spawn sensor workers yet — call [`Runtime::start`] once the caller is
    /// ready to begin scheduling (so an HTTP server can bind first).
    pub async fn new(config: Config, notifier: Option<Arc<dyn Notifier>>) -> Result<Self> {
        Self::with_net(config, notifier, Arc::new(ShellNetAdmin::new()), Arc::new(BlockingRouterOsConnector)).await
    }

    /// Same as [`Runtime::new`] but with swappable `NetAdmin`/RouterOS
    /// connector, so tests can build a full runtime against fakes.
    pub async fn with_net(
        config: Config,
        notifier: Option<Arc<dyn Notifier>>,
        net: Arc<dyn NetAdmin>,
        connector: Arc<dyn RouterOsConnector>,
    ) -> Result<Self> {
        let db = if config.is_memory() { Database::open_memory()? } else { Database::open(&config.database_url)? };
        let store = Store::new(db)?;

        let conf_dir = std::env::temp_dir().join("m360-wg");
        let vpn = Arc::new(VpnManager::new(net.clone(), store.clone(), conf_dir));
        let ros = Arc::new(RouterOsPool::new(connector));
        let events = EventBus::new();
        let rotator = Arc::new(CredentialRotator::new(store.clone(), ros.clone(), events.clone()));
        let notifier = notifier.unwrap_or_else(|| Arc::new(NullNotifier) as Arc<dyn Notifier>);
        let alerts = Arc::new(AlertEngine::new(store.clone(), notifier));
        let scheduler = Arc::new(SensorScheduler::new(store.clone(), vpn.clone(), ros.clone(), rotator.clone(), alerts.clone(), events.clone()));
        let reachability = Arc::new(ReachabilityProbe::new(store.clone(), vpn.clone(), ros.clone()));
        let peers = Arc::new(PeerRegistrar::new(store.clone(), net, config.clone()));

        let keepalive_cancel = CancellationToken::new();
        let keepalive_handle = tokio::spawn(scheduler::run_keepalive_loop(store.clone(), ros.clone(), rotator.clone(), keepalive_cancel.clone()));

        Ok(Self { store, config, vpn, ros, rotator, alerts, events, scheduler, reachability, peers, keepalive_cancel, keepalive_handle })
    }

    /// Spawns every sensor's worker task. Call once, after construction.
    pub async fn start(&self) -> Result<()> {
        self.scheduler.start_all().await
    }

    /// Graceful shutdown (spec.md §5): cancel every worker, the keepalive
    /// loop, then tear every VPN tunnel down entirely.
    pub async fn shutdown(self) {
        info!("runtime shutting down");
        self.scheduler.shutdown().await;
        self.keepalive_cancel.cancel();
        let _ = self.keepalive_handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netadmin::FakeNetAdmin;
    use crate::ros::{RosRow, RouterOsClient};
    use async_trait::async_trait;

    struct AlwaysOkConnector;
    struct AlwaysOkClient;

    #[async_trait]
    impl RouterOsClient for AlwaysOkClient {
        async fn call(&self, _path: &str, _args: &[(&str, &str)]) -> Result<Vec<RosRow>> {
            Ok(vec![])
        }
        async fn disconnect(&self) {}
    }

    #[async_trait]
    impl RouterOsConnector for AlwaysOkConnector {
        async fn open(&self, _ip: &str, _port: u16, _user: &str, _password: &str) -> Result<Arc<dyn RouterOsClient>> {
            Ok(Arc::new(AlwaysOkClient))
        }
    }

    #[tokio::test]
    async fn runtime_builds_and_shuts_down_cleanly_with_no_sensors() {
        let config = Config { database_url: "sqlite::memory:".to_string(), ..Config::default() };
        let runtime = Runtime::with_net(config, None, Arc::new(FakeNetAdmin::new()), Arc::new(AlwaysOkConnector)).await.unwrap();
        runtime.start().await.unwrap();
        runtime.shutdown().await;
    }
}
