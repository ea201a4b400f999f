//! Alert engine (spec.md §4.F): per-alert tolerance counting and cooldown.

use async_trait::async_trait;
use dashmap::DashMap;
use m360_common::{AlertEntry, AlertHistoryEntry, AlertType, InterfaceKind, NotificationChannel, Result, Sensor, Store, TrafficDirection};
use tracing::{debug, info, warn};

/// The outcome of one worker cycle, shaped to cover both sensor types so
/// the engine can evaluate every alert kind from a single struct.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub status: String,
    pub latency_ms: Option<i64>,
    pub speed: Option<String>,
    pub rx_bps: Option<f64>,
    pub tx_bps: Option<f64>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dispatch(&self, channel: &NotificationChannel, details: &str) -> Result<()>;
}

/// Notifier that only logs — used where no channel-specific notifier
/// (webhook/telegram; out of scope per spec.md §1) is wired, e.g. in tests.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn dispatch(&self, channel: &NotificationChannel, details: &str) -> Result<()> {
        debug!(channel = %channel.id, details, "null notifier: would have dispatched");
        Ok(())
    }
}

#[derive(Hash, Eq, PartialEq, Clone)]
struct AlertKey {
    sensor_id: String,
    alert_type: AlertType,
}

pub struct AlertEngine {
    store: Store,
    notifier: std::sync::Arc<dyn Notifier>,
    last_alert_times: DashMap<AlertKey, i64>,
    fail_counters: DashMap<AlertKey, u32>,
    last_known_speed: DashMap<String, String>,
}

impl AlertEngine {
    pub fn new(store: Store, notifier: std::sync::Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            last_alert_times: DashMap::new(),
            fail_counters: DashMap::new(),
            last_known_speed: DashMap::new(),
        }
    }

    fn is_failure(&self, sensor_id: &str, entry: &AlertEntry, outcome: &CycleOutcome) -> bool {
        match entry.alert_type {
            AlertType::Timeout => outcome.status == "timeout",
            AlertType::HighLatency => {
                outcome.status == "ok"
                    && matches!((outcome.latency_ms, entry.threshold_ms), (Some(lat), Some(th)) if lat > th)
            }
            AlertType::LinkDown => outcome.status == "link_down",
            AlertType::SpeedChange => match (self.last_known_speed.get(sensor_id), &outcome.speed) {
                (Some(prev), Some(cur)) => prev.value() != cur,
                _ => false,
            },
            AlertType::TrafficThreshold => {
                let threshold_bps = entry.threshold_mbps.unwrap_or(f64::MAX) * 1_000_000.0;
                let direction = entry.direction.unwrap_or(TrafficDirection::Any);
                let rx_over = matches!(direction, TrafficDirection::Rx | TrafficDirection::Any)
                    && outcome.rx_bps.map(|v| v > threshold_bps).unwrap_or(false);
                let tx_over = matches!(direction, TrafficDirection::Tx | TrafficDirection::Any)
                    && outcome.tx_bps.map(|v| v > threshold_bps).unwrap_or(false);
                rx_over || tx_over
            }
        }
    }

    /// Runs every alert entry on `sensor` against one cycle's `outcome`.
    /// Returns the channel ids notifications were fired on this cycle, for
    /// the caller to relay over the WS fan-out.
    pub async fn evaluate(&self, sensor: &Sensor, interface_kind: Option<InterfaceKind>, outcome: &CycleOutcome) -> Vec<String> {
        let mut fired = Vec::new();
        let now = chrono::Utc::now().timestamp();

        for entry in sensor.config.alerts() {
            if matches!(entry.alert_type, AlertType::LinkDown | AlertType::SpeedChange)
                && interface_kind == Some(InterfaceKind::Vlan)
            {
                continue;
            }

            let key = AlertKey { sensor_id: sensor.id.clone(), alert_type: entry.alert_type };
            let cooldown_secs = entry.cooldown_minutes.max(0) * 60;
            if let Some(last) = self.last_alert_times.get(&key) {
                if now - *last < cooldown_secs {
                    continue;
                }
            }

            if self.is_failure(&sensor.id, entry, outcome) {
                let mut counter = self.fail_counters.entry(key.clone()).or_insert(0);
                *counter += 1;
                if *counter < entry.tolerance_count.max(1) {
                    debug!(sensor_id = %sensor.id, alert_type = ?entry.alert_type, count = *counter, "alert below tolerance");
                    continue;
                }
                *counter = 0;
                drop(counter);

                let details = format!(
                    "{:?} alert on sensor {} (status={}, latency_ms={:?})",
                    entry.alert_type, sensor.id, outcome.status, outcome.latency_ms
                );
                match self.store.get_channel_any_tenant(&entry.channel_id) {
                    Ok(Some(channel)) => {
                        if let Err(e) = self.notifier.dispatch(&channel, &details).await {
                            warn!(channel_id = %entry.channel_id, error = %e, "notification dispatch failed");
                        }
                    }
                    Ok(None) => warn!(channel_id = %entry.channel_id, "alert channel not found"),
                    Err(e) => warn!(error = %e, "failed to load alert channel"),
                }
                let _ = self.store.insert_alert_history(&AlertHistoryEntry {
                    sensor_id: sensor.id.clone(),
                    channel_id: entry.channel_id.clone(),
                    timestamp: now,
                    details: details.clone(),
                });
                self.last_alert_times.insert(key, now);
                info!(sensor_id = %sensor.id, alert_type = ?entry.alert_type, "alert fired");
                fired.push(entry.channel_id.clone());
            } else {
                self.fail_counters.insert(key, 0);
            }
        }

        if let Some(speed) = &outcome.speed {
            self.last_known_speed.insert(sensor.id.clone(), speed.clone());
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m360_common::{AlertEntry, Database, EthernetSensorConfig, SensorConfig, SensorType};

    fn sensor_with_timeout_alert(tolerance: u32, cooldown_minutes: i64) -> Sensor {
        Sensor {
            id: "s1".into(),
            monitor_id: "m1".into(),
            sensor_type: SensorType::Ethernet,
            name: "eth0".into(),
            config: SensorConfig::Ethernet(EthernetSensorConfig {
                interval_sec: 30,
                interface_name: "ether1".into(),
                interface_kind: m360_common::InterfaceKind::Ethernet,
                alerts: vec![AlertEntry {
                    alert_type: AlertType::Timeout,
                    channel_id: "chan1".into(),
                    cooldown_minutes,
                    tolerance_count: tolerance,
                    threshold_ms: None,
                    threshold_mbps: None,
                    direction: None,
                }],
            }),
            owner_id: "t".into(),
        }
    }

    fn engine() -> AlertEngine {
        let store = Store::new(Database::open_memory().unwrap()).unwrap();
        AlertEngine::new(store, std::sync::Arc::new(NullNotifier))
    }

    #[tokio::test]
    async fn tolerance_fires_only_on_the_nth_consecutive_failure() {
        let engine = engine();
        let sensor = sensor_with_timeout_alert(3, 5);
        let failure = CycleOutcome { status: "timeout".into(), ..Default::default() };

        assert!(engine.evaluate(&sensor, None, &failure).await.is_empty());
        assert!(engine.evaluate(&sensor, None, &failure).await.is_empty());
        let fired = engine.evaluate(&sensor, None, &failure).await;
        assert_eq!(fired, vec!["chan1".to_string()]);
    }

    #[tokio::test]
    async fn non_failure_cycle_resets_counter() {
        let engine = engine();
        let sensor = sensor_with_timeout_alert(3, 0);
        let failure = CycleOutcome { status: "timeout".into(), ..Default::default() };
        let ok = CycleOutcome { status: "ok".into(), ..Default::default() };

        engine.evaluate(&sensor, None, &failure).await;
        engine.evaluate(&sensor, None, &ok).await;
        engine.evaluate(&sensor, None, &failure).await;
        engine.evaluate(&sensor, None, &failure).await;
        // Two consecutive failures after the reset: still below tolerance 3.
        assert!(engine.evaluate(&sensor, None, &failure).await.is_empty());
        let fired = engine.evaluate(&sensor, None, &failure).await;
        assert_eq!(fired, vec!["chan1".to_string()]);
    }

    #[tokio::test]
    async fn vlan_gating_skips_link_down_and_speed_change() {
        let engine = engine();
        let mut sensor = sensor_with_timeout_alert(1, 0);
        sensor.config = SensorConfig::Ethernet(EthernetSensorConfig {
            interval_sec: 30,
            interface_name: "vlan70-A".into(),
            interface_kind: m360_common::InterfaceKind::Vlan,
            alerts: vec![AlertEntry {
                alert_type: AlertType::LinkDown,
                channel_id: "chan1".into(),
                cooldown_minutes: 0,
                tolerance_count: 1,
                threshold_ms: None,
                threshold_mbps: None,
                direction: None,
            }],
        });
        let outcome = CycleOutcome { status: "link_down".into(), ..Default::default() };
        assert!(engine.evaluate(&sensor, Some(m360_common::InterfaceKind::Vlan), &outcome).await.is_empty());
    }
}
