//! Shared "bring up and pin the origin's path" helper used by the sensor
//! scheduler (component E, spec.md §4.E's `ensure_origin_connectivity`) and
//! the one-shot reachability probe (component H).

use crate::vpn::VpnManager;
use m360_common::{Device, Error, Result, Store};

/// What a worker or probe needs to unwind when it's done with a device.
/// `None` means the device is reached on plain LAN — nothing to release.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    profile_id: Option<String>,
    ip: String,
}

/// `ensure_origin_connectivity`: if `origin` has a `vpn_profile_id`, bring
/// the tunnel up and pin the origin's own IP through it so the worker can
/// reach it; otherwise this is a no-op (LAN path).
pub async fn ensure_origin_connectivity(vpn: &VpnManager, store: &Store, origin: &Device) -> Result<ConnectivityHandle> {
    let Some(profile_id) = origin.vpn_profile_id.clone() else {
        return Ok(ConnectivityHandle { profile_id: None, ip: origin.ip_address.clone() });
    };
    let profile = store
        .get_vpn_profile_any_tenant(&profile_id)?
        .ok_or_else(|| Error::NotFound { kind: "vpn_profile".into(), id: profile_id.clone() })?;
    vpn.ensure_vpn_up(&profile).await?;
    vpn.add_rule_to_dest(&profile_id, &origin.ip_address).await;
    vpn.pin_host_route(&profile_id, &origin.ip_address).await;
    Ok(ConnectivityHandle { profile_id: Some(profile_id), ip: origin.ip_address.clone() })
}

/// `release_origin_connectivity`: the symmetric unwind, safe to call even if
/// `ensure_origin_connectivity` never ran (e.g. a worker that failed before
/// establishing connectivity) since it's a no-op on a `None` handle.
pub async fn release_origin_connectivity(vpn: &VpnManager, handle: &ConnectivityHandle) {
    let Some(profile_id) = &handle.profile_id else { return };
    vpn.unpin_host_route(profile_id, &handle.ip).await;
    vpn.del_rule_to_dest(profile_id, &handle.ip).await;
    vpn.release_vpn(profile_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netadmin::FakeNetAdmin;
    use m360_common::{Database, VpnProfile};
    use std::sync::Arc;

    fn store_with_profile_device() -> (Store, Device) {
        let store = Store::new(Database::open_memory().unwrap()).unwrap();
        store
            .create_vpn_profile(&VpnProfile {
                id: "p1".into(),
                name: "p".into(),
                config_data: "[Interface]\nAddress = 10.8.0.2/32\nPrivateKey = cGxhY2Vob2xkZXI=\n\n[Peer]\nPublicKey = cGxhY2Vob2xkZXI=\nAllowedIPs = 0.0.0.0/0\n".into(),
                check_ip: None,
                is_default: false,
                owner_id: "t".into(),
            })
            .unwrap();
        let device = Device {
            id: "d1".into(), client_name: "r".into(), ip_address: "10.0.0.5".into(), node: None, mac: None,
            status: "unknown".into(), credential_id: None, is_maestro: false, maestro_id: None,
            vpn_profile_id: Some("p1".into()), owner_id: "t".into(), last_auth_ok: None, last_auth_fail: None,
            rotations_count: 0, wg_address: None,
        };
        store.create_device(&device).unwrap();
        (store, device)
    }

    #[tokio::test]
    async fn ensure_then_release_is_a_no_op_on_the_underlying_state() {
        let (store, device) = store_with_profile_device();
        let fake = Arc::new(FakeNetAdmin::new());
        let dir = tempfile::tempdir().unwrap();
        let vpn = VpnManager::new(fake, store.clone(), dir.path().to_path_buf());

        let handle = ensure_origin_connectivity(&vpn, &store, &device).await.unwrap();
        release_origin_connectivity(&vpn, &handle).await;

        // A second full cycle must behave identically (refcount returned to 0).
        let handle2 = ensure_origin_connectivity(&vpn, &store, &device).await.unwrap();
        release_origin_connectivity(&vpn, &handle2).await;
    }

    #[tokio::test]
    async fn lan_device_has_no_connectivity_to_release() {
        let store = Store::new(Database::open_memory().unwrap()).unwrap();
        let device = Device {
            id: "d2".into(), client_name: "r".into(), ip_address: "192.168.1.1".into(), node: None, mac: None,
            status: "unknown".into(), credential_id: None, is_maestro: false, maestro_id: None,
            vpn_profile_id: None, owner_id: "t".into(), last_auth_ok: None, last_auth_fail: None,
            rotations_count: 0, wg_address: None,
        };
        let fake = Arc::new(FakeNetAdmin::new());
        let dir = tempfile::tempdir().unwrap();
        let vpn = VpnManager::new(fake.clone(), store.clone(), dir.path().to_path_buf());
        let handle = ensure_origin_connectivity(&vpn, &store, &device).await.unwrap();
        release_origin_connectivity(&vpn, &handle).await;
        assert!(fake.history().is_empty());
    }
}
