//! Domain types for the monitoring backend.
//!
//! Tenant-scoped entities all carry `owner_id`, per spec.md §3. JSON-valued
//! columns (`config`, `wg ini`) are parsed into the tagged-variant structs
//! below rather than kept as opaque `serde_json::Value`, per the "Dynamic
//! configuration" design note.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub username: String,
    pub password: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub client_name: String,
    pub ip_address: String,
    pub node: Option<String>,
    pub mac: Option<String>,
    pub status: String,
    pub credential_id: Option<String>,
    pub is_maestro: bool,
    pub maestro_id: Option<String>,
    pub vpn_profile_id: Option<String>,
    pub owner_id: String,
    pub last_auth_ok: Option<i64>,
    pub last_auth_fail: Option<i64>,
    pub rotations_count: i64,
    pub wg_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnProfile {
    pub id: String,
    pub name: String,
    pub config_data: String,
    pub check_ip: Option<String>,
    pub is_default: bool,
    pub owner_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub device_id: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Ping,
    Ethernet,
}

impl std::fmt::Display for SensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorType::Ping => write!(f, "ping"),
            SensorType::Ethernet => write!(f, "ethernet"),
        }
    }
}

impl std::str::FromStr for SensorType {
    type Err = crate::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(SensorType::Ping),
            "ethernet" => Ok(SensorType::Ethernet),
            other => Err(crate::Error::InvalidConfig(format!("unknown sensor_type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Timeout,
    HighLatency,
    SpeedChange,
    TrafficThreshold,
    LinkDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficDirection {
    Rx,
    Tx,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEntry {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub channel_id: String,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_tolerance")]
    pub tolerance_count: u32,
    pub threshold_ms: Option<i64>,
    pub threshold_mbps: Option<f64>,
    pub direction: Option<TrafficDirection>,
}

fn default_cooldown_minutes() -> i64 {
    5
}

fn default_tolerance() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingType {
    MaestroToDevice,
    DeviceToTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    Auto,
    Ethernet,
    Vlan,
}

impl Default for InterfaceKind {
    fn default() -> Self {
        InterfaceKind::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingSensorConfig {
    #[serde(default = "default_ping_interval")]
    pub interval_sec: u64,
    pub latency_threshold_ms: i64,
    pub ping_type: PingType,
    pub target_ip: Option<String>,
    #[serde(default)]
    pub alerts: Vec<AlertEntry>,
}

fn default_ping_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthernetSensorConfig {
    #[serde(default = "default_ethernet_interval")]
    pub interval_sec: u64,
    pub interface_name: String,
    #[serde(default)]
    pub interface_kind: InterfaceKind,
    #[serde(default)]
    pub alerts: Vec<AlertEntry>,
}

fn default_ethernet_interval() -> u64 {
    30
}

/// Tagged-variant decode of `sensors.config`, keyed by `sensors.sensor_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sensor_type", rename_all = "snake_case")]
pub enum SensorConfig {
    Ping(PingSensorConfig),
    Ethernet(EthernetSensorConfig),
}

impl SensorConfig {
    pub fn alerts(&self) -> &[AlertEntry] {
        match self {
            SensorConfig::Ping(c) => &c.alerts,
            SensorConfig::Ethernet(c) => &c.alerts,
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        let secs = match self {
            SensorConfig::Ping(c) => c.interval_sec,
            SensorConfig::Ethernet(c) => c.interval_sec,
        };
        std::time::Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub monitor_id: String,
    pub sensor_type: SensorType,
    pub name: String,
    pub config: SensorConfig,
    pub owner_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Webhook,
    Telegram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub config: serde_json::Value,
    pub owner_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub sensor_id: String,
    pub timestamp: i64,
    pub latency_ms: Option<i64>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthernetResult {
    pub sensor_id: String,
    pub timestamp: i64,
    pub status: String,
    pub speed: String,
    pub rx_bitrate: String,
    pub tx_bitrate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistoryEntry {
    pub sensor_id: String,
    pub channel_id: String,
    pub timestamp: i64,
    pub details: String,
}

/// WireGuard keypair, base64-encoded per wg(8) convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// QR pairing session, keyed by `session_id` with a 300s TTL (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    pub session_id: String,
    pub owner_id: String,
    pub created_at: i64,
    pub claimed_device_id: Option<String>,
}

/// Events raised by the runtime (component D, and broadcast via G).
///
/// These are serialized as the WS payload's `type` field plus its own
/// fields flattened alongside `sensor_id`/`sensor_type` where applicable,
/// per spec.md §6 ("Broadcast messages include `sensor_id` and
/// `sensor_type`").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeEvent {
    #[serde(rename = "ping_result")]
    PingResult {
        owner_id: String,
        sensor_id: String,
        sensor_type: SensorType,
        result: PingResult,
    },
    #[serde(rename = "ethernet_result")]
    EthernetResult {
        owner_id: String,
        sensor_id: String,
        sensor_type: SensorType,
        result: EthernetResult,
    },
    #[serde(rename = "device_credential_rotated")]
    DeviceCredentialRotated {
        owner_id: String,
        device_id: String,
        ok: bool,
        old_credential_id: Option<String>,
        new_credential_id: Option<String>,
        reason: Option<String>,
    },
    #[serde(rename = "alert_fired")]
    AlertFired {
        owner_id: String,
        sensor_id: String,
        channel_id: String,
        details: String,
    },
}

impl RuntimeEvent {
    /// Tenant this event belongs to, used by the WS fan-out's owner match.
    pub fn owner_id(&self) -> &str {
        match self {
            RuntimeEvent::PingResult { owner_id, .. } => owner_id,
            RuntimeEvent::EthernetResult { owner_id, .. } => owner_id,
            RuntimeEvent::DeviceCredentialRotated { owner_id, .. } => owner_id,
            RuntimeEvent::AlertFired { owner_id, .. } => owner_id,
        }
    }

    /// `sensor_id` carried by events that have one, used by the fallback
    /// delivery path (spec.md §4.G).
    pub fn sensor_id(&self) -> Option<&str> {
        match self {
            RuntimeEvent::PingResult { sensor_id, .. } => Some(sensor_id),
            RuntimeEvent::EthernetResult { sensor_id, .. } => Some(sensor_id),
            _ => None,
        }
    }
}
