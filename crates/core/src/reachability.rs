//! One-shot reachability probe & device onboarding (spec.md §4.H).
//!
//! Shares B/C with the scheduler but never registers a long-running task:
//! every tunnel it brings up, it tears down again in a finalizer before
//! returning, success or failure.

use crate::ros::{is_auth_error, RouterOsPool};
use crate::vpn::VpnManager;
use m360_common::{Credential, Error, Result, Store, VpnProfile};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

const OUTER_TIMEOUT: Duration = Duration::from_secs(9);
const OVERALL_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(8);
const PER_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(3);
const ICMP_TCP_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Serialize)]
pub struct ReachabilityRequest {
    pub ip: String,
    pub vpn_profile_id: Option<String>,
    pub maestro_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReachabilityResult {
    pub reachable: bool,
    pub credential_id: Option<String>,
    pub used_profile_id: Option<String>,
    pub detail: Option<String>,
}

pub struct ReachabilityProbe {
    store: Store,
    vpn: std::sync::Arc<VpnManager>,
    ros: std::sync::Arc<RouterOsPool>,
}

impl ReachabilityProbe {
    pub fn new(store: Store, vpn: std::sync::Arc<VpnManager>, ros: std::sync::Arc<RouterOsPool>) -> Self {
        Self { store, vpn, ros }
    }

    pub async fn probe(&self, owner_id: &str, req: ReachabilityRequest) -> Result<ReachabilityResult> {
        tokio::time::timeout(OUTER_TIMEOUT, self.probe_inner(owner_id, req))
            .await
            .unwrap_or_else(|_| {
                Ok(ReachabilityResult { reachable: false, credential_id: None, used_profile_id: None, detail: Some("probe timed out".into()) })
            })
    }

    async fn probe_inner(&self, owner_id: &str, req: ReachabilityRequest) -> Result<ReachabilityResult> {
        if let Some(profile_id) = &req.vpn_profile_id {
            let profile = self
                .store
                .get_vpn_profile(owner_id, profile_id)?;
            return self.probe_via_profile(&profile, &req.ip, profile.check_ip.clone()).await;
        }
        if let Some(maestro_id) = &req.maestro_id {
            let master = self
                .store
                .get_device_by_id_any_tenant(maestro_id)?
                .ok_or_else(|| Error::NotFound { kind: "device".into(), id: maestro_id.clone() })?;
            let Some(profile_id) = master.vpn_profile_id.clone() else {
                return Ok(ReachabilityResult { reachable: false, credential_id: None, used_profile_id: None, detail: Some("master device has no vpn profile".into()) });
            };
            let profile = self
                .store
                .get_vpn_profile_any_tenant(&profile_id)?
                .ok_or_else(|| Error::NotFound { kind: "vpn_profile".into(), id: profile_id })?;
            return self.probe_via_profile(&profile, &req.ip, None).await;
        }
        self.probe_lan(owner_id, &req.ip).await
    }

    async fn probe_via_profile(&self, profile: &VpnProfile, target_ip: &str, check_ip: Option<String>) -> Result<ReachabilityResult> {
        self.vpn.ensure_vpn_up(profile).await?;
        let mut pinned: Vec<String> = Vec::new();
        let result = self.probe_via_profile_pinned(profile, target_ip, check_ip, &mut pinned).await;
        for ip in &pinned {
            self.vpn.unpin_host_route(&profile.id, ip).await;
            self.vpn.del_rule_to_dest(&profile.id, ip).await;
        }
        self.vpn.release_vpn(&profile.id).await;
        result
    }

    async fn probe_via_profile_pinned(
        &self,
        profile: &VpnProfile,
        target_ip: &str,
        check_ip: Option<String>,
        pinned: &mut Vec<String>,
    ) -> Result<ReachabilityResult> {
        if let Some(check) = &check_ip {
            self.vpn.add_rule_to_dest(&profile.id, check).await;
            self.vpn.pin_host_route(&profile.id, check).await;
            pinned.push(check.clone());
            if !icmp_or_tcp_reachable(check).await {
                return Ok(ReachabilityResult {
                    reachable: false,
                    credential_id: None,
                    used_profile_id: Some(profile.id.clone()),
                    detail: Some(format!("check_ip {check} unreachable through profile")),
                });
            }
        }

        self.vpn.add_rule_to_dest(&profile.id, target_ip).await;
        self.vpn.pin_host_route(&profile.id, target_ip).await;
        pinned.push(target_ip.to_string());

        let credential_id = self.try_tenant_credentials(&profile.owner_id, target_ip).await;
        Ok(ReachabilityResult {
            reachable: credential_id.is_some(),
            credential_id,
            used_profile_id: Some(profile.id.clone()),
            detail: None,
        })
    }

    async fn probe_lan(&self, owner_id: &str, ip: &str) -> Result<ReachabilityResult> {
        let credential_id = self.try_tenant_credentials(owner_id, ip).await;
        Ok(ReachabilityResult { reachable: credential_id.is_some(), credential_id, used_profile_id: None, detail: None })
    }

    async fn try_tenant_credentials(&self, owner_id: &str, ip: &str) -> Option<String> {
        let candidates: Vec<Credential> = self.store.list_credentials(owner_id).ok()?;
        tokio::time::timeout(OVERALL_CREDENTIAL_TIMEOUT, async {
            for cred in &candidates {
                let attempt = tokio::time::timeout(PER_CREDENTIAL_TIMEOUT, self.ros.test_login(ip, 8728, &cred.username, &cred.password)).await;
                match attempt {
                    Ok(Ok(())) => return Some(cred.id.clone()),
                    Ok(Err(e)) if is_auth_error(&e.to_string()) => continue,
                    _ => continue,
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }
}

async fn icmp_or_tcp_reachable(ip: &str) -> bool {
    if tcp_probe(ip).await {
        return true;
    }
    icmp_probe(ip).await
}

async fn tcp_probe(ip: &str) -> bool {
    let addr = format!("{ip}:8728");
    tokio::time::timeout(ICMP_TCP_TIMEOUT, tokio::net::TcpStream::connect(&addr)).await.map(|r| r.is_ok()).unwrap_or(false)
}

/// Best-effort ICMP check via the system `ping` binary (`-c1 -W1`), run off
/// the dispatcher since it's a blocking child process.
async fn icmp_probe(ip: &str) -> bool {
    let ip = ip.to_string();
    tokio::task::spawn_blocking(move || {
        std::process::Command::new("ping")
            .args(["-c1", "-W1", &ip])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

impl ReachabilityResult {
    pub fn log_summary(&self, ip: &str) {
        if self.reachable {
            info!(ip, profile = ?self.used_profile_id, "reachability probe succeeded");
        } else {
            warn!(ip, detail = ?self.detail, "reachability probe failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netadmin::FakeNetAdmin;
    use crate::ros::{RosRow, RouterOsClient, RouterOsConnector};
    use async_trait::async_trait;
    use m360_common::Database;
    use std::sync::Arc;

    struct CredentialTwoWorks;
    struct StubClient(bool);

    #[async_trait]
    impl RouterOsClient for StubClient {
        async fn call(&self, _path: &str, _args: &[(&str, &str)]) -> Result<Vec<RosRow>> {
            if self.0 {
                Ok(vec![])
            } else {
                Err(Error::RouterOs("invalid user name or password".into()))
            }
        }
        async fn disconnect(&self) {}
    }

    #[async_trait]
    impl RouterOsConnector for CredentialTwoWorks {
        async fn open(&self, _ip: &str, _port: u16, user: &str, _password: &str) -> Result<Arc<dyn RouterOsClient>> {
            Ok(Arc::new(StubClient(user == "second")))
        }
    }

    fn store() -> Store {
        Store::new(Database::open_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn lan_probe_finds_the_working_credential() {
        let store = store();
        store.create_credential(&Credential { id: "c1".into(), name: "one".into(), username: "first".into(), password: "x".into(), owner_id: "t".into() }).unwrap();
        store.create_credential(&Credential { id: "c2".into(), name: "two".into(), username: "second".into(), password: "x".into(), owner_id: "t".into() }).unwrap();
        let ros = Arc::new(RouterOsPool::new(Arc::new(CredentialTwoWorks)));
        let net = Arc::new(FakeNetAdmin::new());
        let dir = tempfile::tempdir().unwrap();
        let vpn = Arc::new(VpnManager::new(net, store.clone(), dir.path().to_path_buf()));
        let probe = ReachabilityProbe::new(store, vpn, ros);

        let result = probe.probe("t", ReachabilityRequest { ip: "10.0.0.9".into(), vpn_profile_id: None, maestro_id: None }).await.unwrap();
        assert!(result.reachable);
        assert_eq!(result.credential_id.as_deref(), Some("c2"));
        assert!(result.used_profile_id.is_none());
    }

    #[tokio::test]
    async fn unreachable_lan_device_reports_no_credential() {
        let store = store();
        store.create_credential(&Credential { id: "c1".into(), name: "one".into(), username: "nope".into(), password: "x".into(), owner_id: "t".into() }).unwrap();
        let ros = Arc::new(RouterOsPool::new(Arc::new(CredentialTwoWorks)));
        let net = Arc::new(FakeNetAdmin::new());
        let dir = tempfile::tempdir().unwrap();
        let vpn = Arc::new(VpnManager::new(net, store.clone(), dir.path().to_path_buf()));
        let probe = ReachabilityProbe::new(store, vpn, ros);

        let result = probe.probe("t", ReachabilityRequest { ip: "10.0.0.9".into(), vpn_profile_id: None, maestro_id: None }).await.unwrap();
        assert!(!result.reachable);
        assert!(result.credential_id.is_none());
    }
}
