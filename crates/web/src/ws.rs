//! WebSocket fan-out (spec.md §4.G): one authenticated socket per browser
//! client, subscribing to all of a tenant's sensors or a filtered set, with
//! broadcast delivery that falls back to subscription matching when no
//! socket owned by the event's tenant is connected.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use m360_common::{RuntimeEvent, SensorType, Store};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A socket's subscription: `None` means subscribe-all.
#[derive(Clone, Default)]
struct Subscription(Option<HashSet<String>>);

impl Subscription {
    fn matches(&self, sensor_id: &str) -> bool {
        match &self.0 {
            None => true,
            Some(set) => set.contains(sensor_id),
        }
    }
}

struct Socket {
    owner_id: String,
    subscription: std::sync::Mutex<Subscription>,
    tx: mpsc::UnboundedSender<Message>,
}

/// Registry of live sockets, keyed by a per-connection id.
pub struct Hub {
    sockets: DashMap<u64, Arc<Socket>>,
    next_id: AtomicU64,
    store: Store,
}

impl Hub {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self { sockets: DashMap::new(), next_id: AtomicU64::new(1), store })
    }

    /// `broadcast_for(owner, payload)`: deliver to every socket owned by
    /// `owner`. If none matched and the payload carries `sensor_id`, fall
    /// back to any subscribe-all or explicitly-subscribed socket regardless
    /// of owner (spec.md invariant 4's documented exception).
    pub fn broadcast(&self, event: &RuntimeEvent) {
        let payload = event_payload(event);
        let owner = event.owner_id();
        let mut delivered = 0usize;
        let mut dead = Vec::new();
        for entry in self.sockets.iter() {
            let sock = entry.value();
            if sock.owner_id == owner {
                if sock.tx.send(Message::Text(payload.to_string())).is_err() {
                    dead.push(*entry.key());
                } else {
                    delivered += 1;
                }
            }
        }
        if delivered == 0 {
            if let Some(sensor_id) = event.sensor_id() {
                for entry in self.sockets.iter() {
                    let sock = entry.value();
                    if sock.owner_id == owner {
                        continue;
                    }
                    let matches = sock.subscription.lock().unwrap().matches(sensor_id);
                    if matches {
                        if sock.tx.send(Message::Text(payload.to_string())).is_err() {
                            dead.push(*entry.key());
                        }
                    }
                }
            }
        }
        for id in dead {
            self.sockets.remove(&id);
        }
    }
}

fn event_payload(event: &RuntimeEvent) -> Value {
    let mut v = serde_json::to_value(event).unwrap_or(json!({}));
    if let Value::Object(ref mut map) = v {
        map.insert("ts".to_string(), json!(Utc::now().to_rfc3339()));
    }
    v
}

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>, Query(q): Query<WsQuery>, headers: axum::http::HeaderMap) -> impl IntoResponse {
    let cookie = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(';').map(|p| p.trim()).find_map(|p| p.strip_prefix("sb-access-token=")).map(|v| v.to_string()));
    let token = crate::auth::jwt::extract_token(&headers, q.token.as_deref(), cookie.as_deref());

    let Some(token) = token else {
        return (axum::http::StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    let Some(owner_id) = app.jwt.verify(&token).await else {
        return (axum::http::StatusCode::UNAUTHORIZED, "invalid token").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, app, owner_id))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    SubscribeSensors { sensor_ids: Vec<String> },
    SubscribeAll,
    SyncRequest { resource: String },
}

async fn handle_socket(socket: WebSocket, app: AppState, owner_id: String) {
    let id = app.hub.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let sock = Arc::new(Socket { owner_id: owner_id.clone(), subscription: std::sync::Mutex::new(Subscription::default()), tx: tx.clone() });
    app.hub.sockets.insert(id, sock.clone());

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(Message::Text(json!({"type": "welcome", "ts": Utc::now().to_rfc3339()}).to_string()));
    let _ = tx.send(Message::Text(json!({"type": "ready", "ts": Utc::now().to_rfc3339()}).to_string()));
    send_sensor_batch(&app.hub.store, &tx, &owner_id, &sock.subscription.lock().unwrap());

    while let Some(msg) = ws_rx.next().await {
        let Ok(msg) = msg else { break };
        let Message::Text(text) = msg else { continue };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Ping) => {
                let _ = tx.send(Message::Text(json!({"type": "pong", "ts": Utc::now().to_rfc3339()}).to_string()));
            }
            Ok(ClientMessage::SubscribeSensors { sensor_ids }) => {
                *sock.subscription.lock().unwrap() = Subscription(Some(sensor_ids.into_iter().collect()));
                let _ = tx.send(Message::Text(json!({"type": "ready", "ts": Utc::now().to_rfc3339()}).to_string()));
                send_sensor_batch(&app.hub.store, &tx, &owner_id, &sock.subscription.lock().unwrap());
            }
            Ok(ClientMessage::SubscribeAll) => {
                *sock.subscription.lock().unwrap() = Subscription(None);
                let _ = tx.send(Message::Text(json!({"type": "ready", "ts": Utc::now().to_rfc3339()}).to_string()));
                send_sensor_batch(&app.hub.store, &tx, &owner_id, &sock.subscription.lock().unwrap());
            }
            Ok(ClientMessage::SyncRequest { resource }) => {
                if resource == "sensors_latest" {
                    send_sensor_batch(&app.hub.store, &tx, &owner_id, &sock.subscription.lock().unwrap());
                }
            }
            Err(_) => {
                let _ = tx.send(Message::Text(json!({"type": "error", "ts": Utc::now().to_rfc3339()}).to_string()));
            }
        }
    }

    debug!(owner_id, socket_id = id, "ws socket closed");
    app.hub.sockets.remove(&id);
    send_task.abort();
}

fn send_sensor_batch(store: &Store, tx: &mpsc::UnboundedSender<Message>, owner_id: &str, subscription: &Subscription) {
    let sensors = match store.list_sensors_by_owner(owner_id) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to list sensors for ws batch");
            return;
        }
    };
    let mut entries = Vec::new();
    for sensor in sensors {
        if !subscription.matches(&sensor.id) {
            continue;
        }
        let row = match sensor.sensor_type {
            SensorType::Ping => match store.latest_ping_result(&sensor.id) {
                Ok(Some(r)) => serde_json::to_value(r).unwrap_or(json!({})),
                _ => json!({"sensor_id": sensor.id, "status": "pending"}),
            },
            SensorType::Ethernet => match store.latest_ethernet_result(&sensor.id) {
                Ok(Some(r)) => serde_json::to_value(r).unwrap_or(json!({})),
                _ => json!({"sensor_id": sensor.id, "status": "pending"}),
            },
        };
        entries.push(json!({
            "sensor_id": sensor.id,
            "sensor_type": sensor.sensor_type,
            "name": sensor.name,
            "latest": row,
        }));
    }
    let batch = json!({"type": "sensor_batch", "ts": Utc::now().to_rfc3339(), "sensors": entries});
    let _ = tx.send(Message::Text(batch.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use m360_common::{Database, PingResult as CorePingResult};

    fn test_store() -> Store {
        Store::new(Database::open_memory().unwrap()).unwrap()
    }

    fn ping_event(owner_id: &str, sensor_id: &str) -> RuntimeEvent {
        RuntimeEvent::PingResult {
            owner_id: owner_id.to_string(),
            sensor_id: sensor_id.to_string(),
            sensor_type: SensorType::Ping,
            result: CorePingResult { sensor_id: sensor_id.to_string(), timestamp: 0, latency_ms: Some(5), status: "up".into() },
        }
    }

    fn attach_socket(hub: &Arc<Hub>, id: u64, owner_id: &str, subscription: Subscription) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let sock = Arc::new(Socket { owner_id: owner_id.to_string(), subscription: std::sync::Mutex::new(subscription), tx });
        hub.sockets.insert(id, sock);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<String> {
        match rx.try_recv() {
            Ok(Message::Text(t)) => Some(t),
            _ => None,
        }
    }

    #[tokio::test]
    async fn delivers_to_every_socket_owned_by_the_event_tenant() {
        let hub = Hub::new(test_store());
        let mut rx_a = attach_socket(&hub, 1, "tenant-a", Subscription::default());
        let mut rx_b = attach_socket(&hub, 2, "tenant-a", Subscription(Some(["other-sensor".into()].into_iter().collect())));
        let mut rx_other = attach_socket(&hub, 3, "tenant-b", Subscription::default());

        hub.broadcast(&ping_event("tenant-a", "sensor-1"));

        // Both tenant-a sockets receive it regardless of their subscription
        // filter -- owner match alone is sufficient once at least one of the
        // tenant's own sockets is connected.
        assert!(drain(&mut rx_a).is_some());
        assert!(drain(&mut rx_b).is_some());
        assert!(drain(&mut rx_other).is_none());
    }

    #[tokio::test]
    async fn falls_back_to_subscription_match_when_owner_has_no_socket() {
        let hub = Hub::new(test_store());
        // No socket owned by "tenant-a" is connected -- only sockets from
        // other tenants, one of which happens to subscribe to this sensor.
        let mut rx_subscribed = attach_socket(&hub, 1, "tenant-b", Subscription(Some(["sensor-1".into()].into_iter().collect())));
        let mut rx_all = attach_socket(&hub, 2, "tenant-c", Subscription::default());
        let mut rx_unrelated = attach_socket(&hub, 3, "tenant-d", Subscription(Some(["sensor-9".into()].into_iter().collect())));

        hub.broadcast(&ping_event("tenant-a", "sensor-1"));

        assert!(drain(&mut rx_subscribed).is_some(), "explicit subscriber should receive the fallback");
        assert!(drain(&mut rx_all).is_some(), "subscribe-all socket should receive the fallback");
        assert!(drain(&mut rx_unrelated).is_none(), "socket subscribed to a different sensor must not leak this event");
    }

    #[tokio::test]
    async fn fallback_does_not_fire_when_the_owner_already_received_it() {
        let hub = Hub::new(test_store());
        let mut rx_owner = attach_socket(&hub, 1, "tenant-a", Subscription(Some(["sensor-1".into()].into_iter().collect())));
        let mut rx_bystander = attach_socket(&hub, 2, "tenant-b", Subscription::default());

        hub.broadcast(&ping_event("tenant-a", "sensor-1"));

        assert!(drain(&mut rx_owner).is_some());
        // The owner already got it through the primary path, so the
        // fallback must not also hand it to an unrelated subscribe-all
        // socket -- `delivered > 0` short-circuits the fallback loop.
        assert!(drain(&mut rx_bystander).is_none());
    }

    #[test]
    fn subscription_matches() {
        let all = Subscription::default();
        assert!(all.matches("anything"));

        let filtered = Subscription(Some(["a".into(), "b".into()].into_iter().collect()));
        assert!(filtered.matches("a"));
        assert!(!filtered.matches("c"));
    }
}
