//! Sensor scheduler and workers (spec.md §4.E).
//!
//! One task per sensor, tracked in `running_tasks`. Creating, updating, or
//! restarting a sensor cancels its prior task (if any) and respawns it;
//! shutdown cancels every task and waits for its finalizer (connectivity
//! release) to run before `VpnManager::teardown_all_vpns` is called.

use crate::alert::{AlertEngine, CycleOutcome};
use crate::connectivity::{self, ConnectivityHandle};
use crate::events::EventBus;
use crate::ros::{is_auth_error, RosRow, RouterOsPool};
use crate::rotation::CredentialRotator;
use crate::vpn::VpnManager;
use dashmap::DashMap;
use m360_common::{
    Device, EthernetResult, EthernetSensorConfig, InterfaceKind, PingResult, PingSensorConfig, PingType, RuntimeEvent,
    Sensor, SensorConfig, Store,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Shared context every worker closes over. Kept out of `SensorScheduler`
/// itself so spawning a worker doesn't need a self-referential `Arc`.
struct Ctx {
    store: Store,
    vpn: Arc<VpnManager>,
    ros: Arc<RouterOsPool>,
    rotator: Arc<CredentialRotator>,
    alerts: Arc<AlertEngine>,
    events: EventBus,
    /// `(device_ip, iface_name) -> resolved kind`, per spec.md §4.E's "cached
    /// per (device_ip, iface_name)" detection precedence.
    iface_kind_cache: DashMap<(String, String), InterfaceKind>,
}

struct SensorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SensorScheduler {
    ctx: Arc<Ctx>,
    tasks: DashMap<String, SensorTask>,
}

impl SensorScheduler {
    pub fn new(store: Store, vpn: Arc<VpnManager>, ros: Arc<RouterOsPool>, rotator: Arc<CredentialRotator>, alerts: Arc<AlertEngine>, events: EventBus) -> Self {
        Self {
            ctx: Arc::new(Ctx { store, vpn, ros, rotator, alerts, events, iface_kind_cache: DashMap::new() }),
            tasks: DashMap::new(),
        }
    }

    /// Startup: spawn one worker per sensor row across every tenant.
    pub async fn start_all(&self) -> m360_common::Result<()> {
        let sensors = self.ctx.store.list_all_sensors()?;
        info!(count = sensors.len(), "starting sensor workers");
        for sensor in sensors {
            self.spawn(sensor).await;
        }
        Ok(())
    }

    /// Cancels any existing task for `sensor_id` and spawns a fresh one from
    /// the current DB row. No-op if the sensor no longer exists (e.g. a
    /// restart request racing a delete).
    pub async fn restart(&self, sensor_id: &str) -> m360_common::Result<()> {
        self.cancel(sensor_id).await;
        if let Some(sensor) = self.ctx.store.get_sensor_any_tenant(sensor_id)? {
            self.spawn(sensor).await;
        }
        Ok(())
    }

    pub async fn cancel(&self, sensor_id: &str) {
        if let Some((_, task)) = self.tasks.remove(sensor_id) {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    async fn spawn(&self, sensor: Sensor) {
        self.cancel(&sensor.id).await;
        let sensor_id = sensor.id.clone();
        let cancel = CancellationToken::new();
        let ctx = self.ctx.clone();
        let child = cancel.clone();
        let handle = tokio::spawn(async move { run_worker(ctx, sensor, child).await });
        self.tasks.insert(sensor_id, SensorTask { cancel, handle });
    }

    /// Cancels every running worker and tears every tunnel all the way down.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id).await;
        }
        self.ctx.vpn.teardown_all_vpns().await;
    }

    pub fn running_sensor_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|e| e.key().clone()).collect()
    }
}

#[instrument(skip(ctx, sensor, cancel), fields(sensor_id = %sensor.id))]
async fn run_worker(ctx: Arc<Ctx>, sensor: Sensor, cancel: CancellationToken) {
    match &sensor.config {
        SensorConfig::Ping(cfg) => run_ping_worker(ctx, sensor.clone(), cfg.clone(), cancel).await,
        SensorConfig::Ethernet(cfg) => run_ethernet_worker(ctx, sensor.clone(), cfg.clone(), cancel).await,
    }
}

fn resolve_origin_and_target(ctx: &Ctx, sensor: &Sensor, cfg: &PingSensorConfig) -> m360_common::Result<(Device, String)> {
    let own_device = ctx.store.device_for_sensor(sensor)?;
    match cfg.ping_type {
        PingType::MaestroToDevice => {
            let master_id = own_device
                .maestro_id
                .clone()
                .ok_or_else(|| m360_common::Error::InvalidConfig("maestro_to_device sensor on a device with no maestro_id".into()))?;
            let master = ctx
                .store
                .get_device_by_id_any_tenant(&master_id)?
                .ok_or_else(|| m360_common::Error::NotFound { kind: "device".into(), id: master_id })?;
            Ok((master, own_device.ip_address.clone()))
        }
        PingType::DeviceToTarget => {
            let target = cfg
                .target_ip
                .clone()
                .ok_or_else(|| m360_common::Error::InvalidConfig("device_to_target sensor missing target_ip".into()))?;
            Ok((own_device, target))
        }
    }
}

async fn run_ping_worker(ctx: Arc<Ctx>, sensor: Sensor, cfg: PingSensorConfig, cancel: CancellationToken) {
    let (origin, target) = match resolve_origin_and_target(&ctx, &sensor, &cfg) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "ping worker could not resolve origin/target, exiting");
            return;
        }
    };

    let conn = match connectivity::ensure_origin_connectivity(&ctx.vpn, &ctx.store, &origin).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "ping worker could not establish origin connectivity, exiting");
            return;
        }
    };

    let interval = Duration::from_secs(cfg.interval_sec.max(1));
    loop {
        ping_cycle(&ctx, &sensor, &cfg, &origin, &target).await;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    connectivity::release_origin_connectivity(&ctx.vpn, &conn).await;
}

fn parse_avg_rtt_ms(raw: &str) -> Option<i64> {
    let (sec_part, rest) = raw.trim().split_once('s')?;
    let ms_part = rest.strip_suffix("ms")?;
    let secs: i64 = sec_part.parse().ok()?;
    let ms: i64 = ms_part.parse().ok()?;
    Some(secs * 1000 + ms)
}

async fn ping_cycle(ctx: &Ctx, sensor: &Sensor, cfg: &PingSensorConfig, origin: &Device, target: &str) {
    let now = chrono::Utc::now().timestamp();
    let (latency_ms, status, auth_failure) = match do_ping(ctx, origin, target).await {
        Ok(rows) => {
            let row = rows.first().cloned().unwrap_or_default();
            let received: i64 = row.get("received").and_then(|v| v.parse().ok()).unwrap_or(0);
            let latency_ms = row.get("avg-rtt").and_then(|v| parse_avg_rtt_ms(v));
            let status = if received == 1 {
                match latency_ms {
                    Some(lat) if lat > cfg.latency_threshold_ms => "high_latency",
                    _ => "ok",
                }
            } else {
                "timeout"
            };
            (latency_ms, status.to_string(), false)
        }
        Err(e) => {
            let auth = is_auth_error(&e.to_string());
            (None, "timeout".to_string(), auth)
        }
    };

    let result = PingResult { sensor_id: sensor.id.clone(), timestamp: now, latency_ms, status: status.clone() };
    if let Err(e) = ctx.store.insert_ping_result(&result) {
        warn!(error = %e, "failed to persist ping result");
    }
    ctx.events.publish(RuntimeEvent::PingResult {
        owner_id: sensor.owner_id.clone(),
        sensor_id: sensor.id.clone(),
        sensor_type: m360_common::SensorType::Ping,
        result: result.clone(),
    });

    let outcome = CycleOutcome { status, latency_ms, ..Default::default() };
    let fired = ctx.alerts.evaluate(sensor, None, &outcome).await;
    for channel_id in fired {
        ctx.events.publish(RuntimeEvent::AlertFired {
            owner_id: sensor.owner_id.clone(),
            sensor_id: sensor.id.clone(),
            channel_id,
            details: format!("ping alert on sensor {}", sensor.id),
        });
    }

    if auth_failure {
        if let Some(new_cred) = ctx.rotator.rotate(&origin.id, &origin.ip_address, &sensor.owner_id).await {
            info!(device_id = %origin.id, credential_id = %new_cred, "ping worker rotated credential");
        }
    }
}

async fn do_ping(ctx: &Ctx, origin: &Device, target: &str) -> m360_common::Result<Vec<RosRow>> {
    let credential_id = origin
        .credential_id
        .clone()
        .ok_or_else(|| m360_common::Error::RouterOs("device has no credential assigned".into()))?;
    let cred = ctx.store.get_credential(&origin.owner_id, &credential_id)?;
    let session = ctx.ros.get_or_open(&origin.ip_address, &cred.username, &cred.password).await?;
    let result = session.call("/ping", &[("address", target), ("count", "1")]).await;
    if result.is_err() {
        ctx.ros.invalidate(&origin.ip_address).await;
    }
    result
}

async fn run_ethernet_worker(ctx: Arc<Ctx>, sensor: Sensor, cfg: EthernetSensorConfig, cancel: CancellationToken) {
    let origin = match ctx.store.device_for_sensor(&sensor) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "ethernet worker could not resolve device, exiting");
            return;
        }
    };

    let conn = match connectivity::ensure_origin_connectivity(&ctx.vpn, &ctx.store, &origin).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "ethernet worker could not establish origin connectivity, exiting");
            return;
        }
    };

    let interval = Duration::from_secs(cfg.interval_sec.max(1));
    loop {
        ethernet_cycle(&ctx, &sensor, &cfg, &origin).await;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    connectivity::release_origin_connectivity(&ctx.vpn, &conn).await;
}

/// Interface kind detection precedence, spec.md §4.E.
async fn resolve_interface_kind(ctx: &Ctx, origin: &Device, cfg: &EthernetSensorConfig) -> m360_common::Result<InterfaceKind> {
    if cfg.interface_kind != InterfaceKind::Auto {
        return Ok(cfg.interface_kind);
    }
    let cache_key = (origin.ip_address.clone(), cfg.interface_name.clone());
    if let Some(kind) = ctx.iface_kind_cache.get(&cache_key) {
        return Ok(*kind);
    }

    let name = &cfg.interface_name;
    let lower = name.to_ascii_lowercase();
    if lower.contains("vlan") || name.rsplit('.').next().map(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())).unwrap_or(false) {
        ctx.iface_kind_cache.insert(cache_key, InterfaceKind::Vlan);
        return Ok(InterfaceKind::Vlan);
    }

    let credential_id = origin
        .credential_id
        .clone()
        .ok_or_else(|| m360_common::Error::RouterOs("device has no credential assigned".into()))?;
    let cred = ctx.store.get_credential(&origin.owner_id, &credential_id)?;
    let session = ctx.ros.get_or_open(&origin.ip_address, &cred.username, &cred.password).await?;

    if session.call("/interface/vlan/get", &[("name", name)]).await.is_ok() {
        ctx.iface_kind_cache.insert(cache_key, InterfaceKind::Vlan);
        return Ok(InterfaceKind::Vlan);
    }
    if let Ok(rows) = session.call("/interface/get", &[("name", name)]).await {
        let kind_hint = rows.first().and_then(|r| r.get("type")).map(|s| s.to_ascii_lowercase()).unwrap_or_default();
        if kind_hint.contains("vlan") {
            ctx.iface_kind_cache.insert(cache_key, InterfaceKind::Vlan);
            return Ok(InterfaceKind::Vlan);
        }
        if kind_hint.contains("ether") {
            ctx.iface_kind_cache.insert(cache_key, InterfaceKind::Ethernet);
            return Ok(InterfaceKind::Ethernet);
        }
    }
    if session.call("/interface/ethernet/get", &[("name", name)]).await.is_ok() {
        ctx.iface_kind_cache.insert(cache_key, InterfaceKind::Ethernet);
        return Ok(InterfaceKind::Ethernet);
    }
    ctx.iface_kind_cache.insert(cache_key, InterfaceKind::Ethernet);
    Ok(InterfaceKind::Ethernet)
}

async fn ethernet_cycle(ctx: &Ctx, sensor: &Sensor, cfg: &EthernetSensorConfig, origin: &Device) {
    let now = chrono::Utc::now().timestamp();
    let kind = resolve_interface_kind(ctx, origin, cfg).await.unwrap_or(InterfaceKind::Ethernet);

    let (mut result, auth_failure) = match ethernet_probe(ctx, origin, cfg, kind).await {
        Ok(r) => (r, false),
        Err(e) => {
            let auth = is_auth_error(&e.to_string());
            let synth = EthernetResult {
                sensor_id: sensor.id.clone(),
                timestamp: now,
                status: if kind == InterfaceKind::Vlan { "ok".to_string() } else { "link_down".to_string() },
                speed: "N/A".to_string(),
                rx_bitrate: "0".to_string(),
                tx_bitrate: "0".to_string(),
            };
            (synth, auth)
        }
    };
    result.sensor_id = sensor.id.clone();

    if let Err(e) = ctx.store.insert_ethernet_result(&result) {
        warn!(error = %e, "failed to persist ethernet result");
    }
    ctx.events.publish(RuntimeEvent::EthernetResult {
        owner_id: sensor.owner_id.clone(),
        sensor_id: sensor.id.clone(),
        sensor_type: m360_common::SensorType::Ethernet,
        result: result.clone(),
    });

    let outcome = CycleOutcome {
        status: result.status.clone(),
        speed: Some(result.speed.clone()),
        rx_bps: parse_numeric_prefix(&result.rx_bitrate),
        tx_bps: parse_numeric_prefix(&result.tx_bitrate),
        ..Default::default()
    };
    let fired = ctx.alerts.evaluate(sensor, Some(kind), &outcome).await;
    for channel_id in fired {
        ctx.events.publish(RuntimeEvent::AlertFired {
            owner_id: sensor.owner_id.clone(),
            sensor_id: sensor.id.clone(),
            channel_id,
            details: format!("ethernet alert on sensor {}", sensor.id),
        });
    }

    if auth_failure {
        if let Some(new_cred) = ctx.rotator.rotate(&origin.id, &origin.ip_address, &sensor.owner_id).await {
            info!(device_id = %origin.id, credential_id = %new_cred, "ethernet worker rotated credential");
        }
    }
}

fn parse_numeric_prefix(s: &str) -> Option<f64> {
    let digits_end = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    s[..digits_end].parse().ok()
}

async fn ethernet_probe(ctx: &Ctx, origin: &Device, cfg: &EthernetSensorConfig, kind: InterfaceKind) -> m360_common::Result<EthernetResult> {
    let credential_id = origin
        .credential_id
        .clone()
        .ok_or_else(|| m360_common::Error::RouterOs("device has no credential assigned".into()))?;
    let cred = ctx.store.get_credential(&origin.owner_id, &credential_id)?;
    let session = ctx.ros.get_or_open(&origin.ip_address, &cred.username, &cred.password).await?;
    let name = &cfg.interface_name;
    let now = chrono::Utc::now().timestamp();

    let traffic = session.call("/interface/monitor-traffic", &[("interface", name), ("once", "")]).await;
    if traffic.is_err() {
        ctx.ros.invalidate(&origin.ip_address).await;
    }
    let traffic = traffic?;
    let traffic_row = traffic.first().cloned().unwrap_or_default();
    let rx = traffic_row.get("rx-bits-per-second").cloned().unwrap_or_else(|| "0".to_string());
    let tx = traffic_row.get("tx-bits-per-second").cloned().unwrap_or_else(|| "0".to_string());

    if kind == InterfaceKind::Vlan {
        return Ok(EthernetResult { sensor_id: String::new(), timestamp: now, status: "ok".to_string(), speed: "N/A".to_string(), rx_bitrate: rx, tx_bitrate: tx });
    }

    let iface_rows = session.call("/interface/get", &[("name", name)]).await?;
    let running = iface_rows.first().and_then(|r| r.get("running")).map(|v| v == "true").unwrap_or(false);
    let status = if running { "link_up" } else { "link_down" };

    let eth_rows = session.call("/interface/ethernet/get", &[("name", name)]).await.unwrap_or_default();
    let speed = eth_rows
        .first()
        .and_then(|r| r.get("speed").or_else(|| r.get("rate")))
        .cloned()
        .unwrap_or_else(|| "N/A".to_string());

    Ok(EthernetResult { sensor_id: String::new(), timestamp: now, status: status.to_string(), speed, rx_bitrate: rx, tx_bitrate: tx })
}

/// Keepalive loop (spec.md §4.E): every 30s, health-check every pooled
/// RouterOS session and rotate or reconnect on failure.
pub async fn run_keepalive_loop(store: Store, ros: Arc<RouterOsPool>, rotator: Arc<CredentialRotator>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        for ip in ros.known_ips() {
            if ros.health_check(&ip).await.is_ok() {
                continue;
            }
            ros.invalidate(&ip).await;
            let Ok(Some(device)) = store.get_device_by_ip_any_tenant(&ip) else { continue };
            let Some(cred_id) = &device.credential_id else { continue };
            let Ok(cred) = store.get_credential(&device.owner_id, cred_id) else { continue };
            match ros.get_or_open(&ip, &cred.username, &cred.password).await {
                Ok(_) => {}
                Err(e) if is_auth_error(&e.to_string()) => {
                    rotator.rotate(&device.id, &ip, &device.owner_id).await;
                }
                Err(_) => {
                    // best-effort: leave the session dropped, next sensor
                    // cycle will retry the reconnect on its own.
                }
            }
        }
    }
}
