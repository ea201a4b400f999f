//! Credential rotation on RouterOS auth failure (spec.md §4.D).

use crate::events::EventBus;
use crate::ros::RouterOsPool;
use dashmap::DashMap;
use m360_common::{RuntimeEvent, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

const ROTATION_COOLDOWN: Duration = Duration::from_secs(180);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
const PER_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(3);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(8);

pub struct CredentialRotator {
    store: Store,
    pool: Arc<RouterOsPool>,
    events: EventBus,
    locks: DashMap<String, Arc<Mutex<()>>>,
    last_try: DashMap<String, std::time::Instant>,
}

impl CredentialRotator {
    pub fn new(store: Store, pool: Arc<RouterOsPool>, events: EventBus) -> Self {
        Self { store, pool, events, locks: DashMap::new(), last_try: DashMap::new() }
    }

    fn lock_for(&self, ip: &str) -> Arc<Mutex<()>> {
        self.locks.entry(ip.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn cooldown_active(&self, ip: &str) -> bool {
        self.last_try.get(ip).map(|t| t.elapsed() < ROTATION_COOLDOWN).unwrap_or(false)
    }

    /// `rotate(device_ip, tenant)`. Returns the new credential id on a
    /// successful (possibly no-op) rotation.
    pub async fn rotate(&self, device_id: &str, device_ip: &str, owner_id: &str) -> Option<String> {
        if self.cooldown_active(device_ip) {
            return None;
        }
        let lock = self.lock_for(device_ip);
        let _guard = lock.lock().await;
        if self.cooldown_active(device_ip) {
            return None;
        }
        self.last_try.insert(device_ip.to_string(), std::time::Instant::now());

        let candidates = match self.store.list_credentials(owner_id) {
            Ok(c) => c,
            Err(e) => {
                warn!(device_id, error = %e, "failed to load tenant credentials for rotation");
                return None;
            }
        };

        let device = match self.store.get_device_by_id_any_tenant(device_id) {
            Ok(Some(d)) => d,
            _ => return None,
        };

        if tcp_probe(device_ip).await.is_err() {
            // Still worth trying logins below; a probe failure on a flaky
            // link shouldn't by itself prevent a rotation attempt.
        }

        let overall = tokio::time::timeout(OVERALL_TIMEOUT, async {
            for cred in &candidates {
                let attempt = tokio::time::timeout(
                    PER_CREDENTIAL_TIMEOUT,
                    self.pool.test_login(device_ip, 8728, &cred.username, &cred.password),
                )
                .await;
                if matches!(attempt, Ok(Ok(()))) {
                    return Some(cred.id.clone());
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        let now = chrono::Utc::now().timestamp();
        match overall {
            None => {
                let _ = self.store.mark_auth_fail(device_id, now);
                self.events.publish(RuntimeEvent::DeviceCredentialRotated {
                    owner_id: owner_id.to_string(),
                    device_id: device_id.to_string(),
                    ok: false,
                    old_credential_id: device.credential_id.clone(),
                    new_credential_id: None,
                    reason: Some("no_valid_credentials".to_string()),
                });
                None
            }
            Some(new_id) if Some(&new_id) == device.credential_id.as_ref() => {
                let _ = self.store.mark_auth_ok(device_id, now);
                Some(new_id)
            }
            Some(new_id) => {
                if let Err(e) = self.store.rotate_device_credential(device_id, &new_id, now) {
                    warn!(device_id, error = %e, "failed to persist credential rotation");
                    return None;
                }
                self.pool.invalidate(device_ip).await;
                info!(device_id, old = ?device.credential_id, new = %new_id, "credential rotated");
                self.events.publish(RuntimeEvent::DeviceCredentialRotated {
                    owner_id: owner_id.to_string(),
                    device_id: device_id.to_string(),
                    ok: true,
                    old_credential_id: device.credential_id.clone(),
                    new_credential_id: Some(new_id.clone()),
                    reason: None,
                });
                Some(new_id)
            }
        }
    }
}

async fn tcp_probe(ip: &str) -> std::io::Result<()> {
    let addr = format!("{ip}:8728");
    tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tcp probe timed out"))?
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ros::{RouterOsClient, RouterOsConnector};
    use async_trait::async_trait;
    use m360_common::{Credential, Database, Device};

    struct OnlyCredentialTwoWorks;

    struct StubClient(bool);
    #[async_trait]
    impl RouterOsClient for StubClient {
        async fn call(&self, _p: &str, _a: &[(&str, &str)]) -> m360_common::Result<Vec<crate::ros::RosRow>> {
            if self.0 {
                Ok(vec![])
            } else {
                Err(m360_common::Error::RouterOs("invalid user name or password".into()))
            }
        }
        async fn disconnect(&self) {}
    }

    #[async_trait]
    impl RouterOsConnector for OnlyCredentialTwoWorks {
        async fn open(&self, _ip: &str, _port: u16, user: &str, _password: &str) -> m360_common::Result<Arc<dyn RouterOsClient>> {
            Ok(Arc::new(StubClient(user == "second")))
        }
    }

    #[tokio::test]
    async fn rotation_picks_first_working_credential_and_respects_cooldown() {
        let store = test_store();
        store
            .create_device(&Device {
                id: "d1".into(), client_name: "r".into(), ip_address: "127.0.0.1".into(), node: None, mac: None,
                status: "unknown".into(), credential_id: Some("c1".into()), is_maestro: false, maestro_id: None,
                vpn_profile_id: None, owner_id: "t".into(), last_auth_ok: None, last_auth_fail: None,
                rotations_count: 0, wg_address: None,
            })
            .unwrap();
        store.create_credential(&Credential { id: "c1".into(), name: "one".into(), username: "first".into(), password: "x".into(), owner_id: "t".into() }).unwrap();
        store.create_credential(&Credential { id: "c2".into(), name: "two".into(), username: "second".into(), password: "x".into(), owner_id: "t".into() }).unwrap();

        let pool = Arc::new(RouterOsPool::new(Arc::new(OnlyCredentialTwoWorks)));
        let events = EventBus::new();
        let rotator = CredentialRotator::new(store.clone(), pool, events);

        let new_id = rotator.rotate("d1", "127.0.0.1", "t").await;
        assert_eq!(new_id.as_deref(), Some("c2"));
        assert_eq!(store.get_device("t", "d1").unwrap().rotations_count, 1);

        // Immediate second attempt must be a no-op (180s cooldown).
        let second = rotator.rotate("d1", "127.0.0.1", "t").await;
        assert_eq!(second, None);
        assert_eq!(store.get_device("t", "d1").unwrap().rotations_count, 1);
    }

    fn test_store() -> Store {
        Store::new(Database::open_memory().unwrap()).unwrap()
    }
}
