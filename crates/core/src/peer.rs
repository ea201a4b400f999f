//! WireGuard peer registration, server side (spec.md §4.J).

use crate::config::Config;
use crate::netadmin::NetAdmin;
use ipnetwork::Ipv4Network;
use m360_common::{Device, Error, Result, Store, WgKeyPair};
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RegisterPeerRequest {
    pub device_id: String,
    pub owner_id: String,
    pub endpoint_host: Option<String>,
    pub endpoint_port: Option<u16>,
    pub dns: Option<String>,
    pub allowed_ips: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredPeer {
    pub client_ini: String,
    pub routeros_snippet: String,
    pub client_ip: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStatus {
    pub connected: bool,
    pub latest_handshake: Option<i64>,
}

pub struct PeerRegistrar {
    store: Store,
    net: Arc<dyn NetAdmin>,
    config: Config,
}

impl PeerRegistrar {
    pub fn new(store: Store, net: Arc<dyn NetAdmin>, config: Config) -> Self {
        Self { store, net, config }
    }

    /// `mikrotik_auto_register`.
    pub async fn register(&self, req: RegisterPeerRequest) -> Result<RegisteredPeer> {
        let endpoint_host = req
            .endpoint_host
            .clone()
            .or_else(|| self.config.wg_endpoint_host.clone())
            .ok_or_else(|| Error::InvalidConfig("no WG endpoint host configured or supplied".into()))?;
        let endpoint_port = req.endpoint_port.unwrap_or(self.config.wg_endpoint_port);
        let server_pubkey = self
            .config
            .wg_server_public_key
            .clone()
            .ok_or_else(|| Error::InvalidConfig("WG_SERVER_PUBLIC_KEY not configured".into()))?;
        let dns = req.dns.clone().or_else(|| self.config.wg_dns_default.clone());
        let allowed_ips = req.allowed_ips.clone().unwrap_or_else(|| "0.0.0.0/0".to_string());
        let iface = self.config.wg_interface.clone();

        let keypair = self.generate_keypair().await?;

        let pool_cidr = self
            .config
            .wg_pool_cidr
            .clone()
            .ok_or_else(|| Error::InvalidConfig("WG_POOL_CIDR not configured".into()))?;
        let client_ip = self.allocate_address(&pool_cidr)?;

        let set_out = self
            .net
            .run(&["wg", "set", &iface, "peer", &keypair.public_key, "allowed-ips", &format!("{client_ip}/32")])
            .await;
        if !set_out.ok {
            return Err(Error::Vpn(format!("wg set peer failed: {}", set_out.stderr)));
        }

        let device = match self.store.get_device(&req.owner_id, &req.device_id) {
            Ok(d) => d,
            Err(e) => {
                self.rollback_peer(&iface, &keypair.public_key).await;
                return Err(e);
            }
        };
        self.persist_wg_address(&device, &client_ip);

        let client_ini = render_client_ini(&keypair, &client_ip, &server_pubkey, &endpoint_host, endpoint_port, dns.as_deref(), &allowed_ips);
        let routeros_snippet = render_routeros_snippet(&iface, &keypair, &client_ip, &server_pubkey, &endpoint_host, endpoint_port, &allowed_ips);

        info!(device_id = %req.device_id, client_ip = %client_ip, "registered wireguard peer");
        Ok(RegisteredPeer { client_ini, routeros_snippet, client_ip })
    }

    async fn rollback_peer(&self, iface: &str, client_pub: &str) {
        warn!(iface, "rolling back wg peer after failed registration");
        self.net.run_quiet(&["wg", "set", iface, "peer", client_pub, "remove"]).await;
    }

    fn persist_wg_address(&self, device: &Device, client_ip: &str) {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self.store.set_wg_address(&device.id, client_ip, now) {
            warn!(device_id = %device.id, error = %e, "failed to persist wg_address (non-fatal)");
        }
    }

    async fn generate_keypair(&self) -> Result<WgKeyPair> {
        let priv_out = self.net.run_piped(&["wg", "genkey"], "").await;
        if !priv_out.ok {
            return Err(Error::Vpn(format!("wg genkey failed: {}", priv_out.stderr)));
        }
        let private_key = priv_out.stdout.trim().to_string();
        let pub_out = self.net.run_piped(&["wg", "pubkey"], &private_key).await;
        if !pub_out.ok {
            return Err(Error::Vpn(format!("wg pubkey failed: {}", pub_out.stderr)));
        }
        let public_key = pub_out.stdout.trim().to_string();
        Ok(WgKeyPair { private_key, public_key })
    }

    /// Enumerates pool CIDR host addresses (excluding network/broadcast),
    /// reserves the first as the server address, and returns the first
    /// remaining host not already present in `devices.wg_address`.
    fn allocate_address(&self, pool_cidr: &str) -> Result<String> {
        let network = Ipv4Network::from_str(pool_cidr).map_err(|e| Error::InvalidConfig(format!("invalid WG_POOL_CIDR {pool_cidr}: {e}")))?;
        let start = u32::from(network.network()).wrapping_add(1);
        let end = u32::from(network.broadcast());
        if end <= start {
            return Err(Error::InvalidConfig(format!("WG_POOL_CIDR {pool_cidr} has no usable host addresses")));
        }
        let mut hosts = (start..end).map(Ipv4Addr::from);
        let _server_addr = hosts.next();

        let used: HashSet<String> = self
            .store
            .list_all_devices()?
            .into_iter()
            .filter_map(|d| d.wg_address)
            .map(|addr| addr.split('/').next().unwrap_or_default().to_string())
            .collect();

        for host in hosts {
            let candidate = host.to_string();
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::Conflict("wireguard address pool exhausted".into()))
    }

    /// `peer_status(pub, iface)`: parses `wg show <iface> dump`, tolerant of
    /// both the prefixed and unprefixed line formats.
    pub async fn peer_status(&self, pubkey: &str) -> Result<PeerStatus> {
        let iface = self.config.wg_interface.clone();
        let out = self.net.run_quiet(&["wg", "show", &iface, "dump"]).await;
        if !out.ok {
            return Err(Error::Vpn(format!("wg show dump failed: {}", out.stderr)));
        }
        let now = chrono::Utc::now().timestamp();
        for line in out.stdout.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            // Prefixed: iface pubkey psk endpoint allowed-ips handshake rx tx keepalive
            // Unprefixed (iface header omitted by `dump` on some ROS builds): pubkey ...
            let (key_field, handshake_field) = if fields.len() >= 9 && fields[0] == iface {
                (fields[1], fields[5])
            } else if fields.len() >= 8 {
                (fields[0], fields[4])
            } else {
                continue;
            };
            if key_field != pubkey {
                continue;
            }
            let handshake: i64 = handshake_field.parse().unwrap_or(0);
            let connected = handshake > 0 && (now - handshake) < 180;
            return Ok(PeerStatus { connected, latest_handshake: if handshake > 0 { Some(handshake) } else { None } });
        }
        Ok(PeerStatus { connected: false, latest_handshake: None })
    }
}

fn render_client_ini(
    keypair: &WgKeyPair,
    client_ip: &str,
    server_pubkey: &str,
    endpoint_host: &str,
    endpoint_port: u16,
    dns: Option<&str>,
    allowed_ips: &str,
) -> String {
    let mut s = String::new();
    s.push_str("[Interface]\n");
    s.push_str(&format!("PrivateKey = {}\n", keypair.private_key));
    s.push_str(&format!("Address = {client_ip}/32\n"));
    if let Some(dns) = dns {
        s.push_str(&format!("DNS = {dns}\n"));
    }
    s.push_str("\n[Peer]\n");
    s.push_str(&format!("PublicKey = {server_pubkey}\n"));
    s.push_str(&format!("Endpoint = {endpoint_host}:{endpoint_port}\n"));
    s.push_str(&format!("AllowedIPs = {allowed_ips}\n"));
    s.push_str("PersistentKeepalive = 25\n");
    s
}

fn render_routeros_snippet(
    iface: &str,
    keypair: &WgKeyPair,
    client_ip: &str,
    server_pubkey: &str,
    endpoint_host: &str,
    endpoint_port: u16,
    allowed_ips: &str,
) -> String {
    format!(
        "/interface wireguard add name={iface} private-key=\"{private_key}\"\n\
         /ip address add address={client_ip}/32 interface={iface}\n\
         /interface wireguard peers add interface={iface} public-key=\"{server_pubkey}\" \
         endpoint-address={endpoint_host} endpoint-port={endpoint_port} allowed-address={allowed_ips} \
         route-distance=254 persistent-keepalive=25s\n",
        private_key = keypair.private_key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netadmin::FakeNetAdmin;
    use m360_common::Database;

    fn config() -> Config {
        Config {
            wg_pool_cidr: Some("10.9.0.0/29".into()),
            wg_server_public_key: Some("serverpub=".into()),
            wg_endpoint_host: Some("vpn.example.com".into()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn register_allocates_first_free_host_after_the_server_address() {
        let store = Store::new(Database::open_memory().unwrap()).unwrap();
        store
            .create_device(&Device {
                id: "d1".into(), client_name: "r".into(), ip_address: "192.168.1.1".into(), node: None, mac: None,
                status: "unknown".into(), credential_id: None, is_maestro: false, maestro_id: None,
                vpn_profile_id: None, owner_id: "t".into(), last_auth_ok: None, last_auth_fail: None,
                rotations_count: 0, wg_address: None,
            })
            .unwrap();

        let net = Arc::new(FakeNetAdmin::new());
        let registrar = PeerRegistrar::new(store.clone(), net.clone(), config());
        let result = registrar
            .register(RegisterPeerRequest { device_id: "d1".into(), owner_id: "t".into(), endpoint_host: None, endpoint_port: None, dns: None, allowed_ips: None })
            .await
            .unwrap();

        // .0 is the network address, .1 is reserved for the server.
        assert_eq!(result.client_ip, "10.9.0.2");
        assert!(result.client_ini.contains("[Interface]"));
        assert!(result.routeros_snippet.contains("/interface wireguard add"));
        assert_eq!(store.get_device("t", "d1").unwrap().wg_address.as_deref(), Some("10.9.0.2"));
    }

    #[tokio::test]
    async fn register_skips_addresses_already_taken() {
        let store = Store::new(Database::open_memory().unwrap()).unwrap();
        store
            .create_device(&Device {
                id: "d1".into(), client_name: "r1".into(), ip_address: "192.168.1.1".into(), node: None, mac: None,
                status: "unknown".into(), credential_id: None, is_maestro: false, maestro_id: None,
                vpn_profile_id: None, owner_id: "t".into(), last_auth_ok: None, last_auth_fail: None,
                rotations_count: 0, wg_address: Some("10.9.0.2".into()),
            })
            .unwrap();
        store
            .create_device(&Device {
                id: "d2".into(), client_name: "r2".into(), ip_address: "192.168.1.2".into(), node: None, mac: None,
                status: "unknown".into(), credential_id: None, is_maestro: false, maestro_id: None,
                vpn_profile_id: None, owner_id: "t".into(), last_auth_ok: None, last_auth_fail: None,
                rotations_count: 0, wg_address: None,
            })
            .unwrap();

        let net = Arc::new(FakeNetAdmin::new());
        let registrar = PeerRegistrar::new(store.clone(), net.clone(), config());
        let result = registrar
            .register(RegisterPeerRequest { device_id: "d2".into(), owner_id: "t".into(), endpoint_host: None, endpoint_port: None, dns: None, allowed_ips: None })
            .await
            .unwrap();

        assert_eq!(result.client_ip, "10.9.0.3");
    }

    #[tokio::test]
    async fn failed_keypair_generation_surfaces_as_vpn_error() {
        let store = Store::new(Database::open_memory().unwrap()).unwrap();
        let net = Arc::new(FakeNetAdmin::new());
        net.fail("wg genkey");
        let registrar = PeerRegistrar::new(store, net, config());
        let result = registrar
            .register(RegisterPeerRequest { device_id: "missing".into(), owner_id: "t".into(), endpoint_host: None, endpoint_port: None, dns: None, allowed_ips: None })
            .await;
        assert!(matches!(result, Err(Error::Vpn(_))));
    }

    #[tokio::test]
    async fn peer_status_parses_unprefixed_dump_line() {
        let store = Store::new(Database::open_memory().unwrap()).unwrap();
        let net = Arc::new(FakeNetAdmin::new());
        let now = chrono::Utc::now().timestamp();
        let line = format!("clientpub=\tpsk\tendpoint\t10.9.0.2/32\t{now}\t0\t0\t25");
        net.set_stdout("wg show wg0 dump", &line);
        let registrar = PeerRegistrar::new(store, net, config());
        let status = registrar.peer_status("clientpub=").await.unwrap();
        assert!(status.connected);
    }
}
