//! Sensor CRUD, restart, details, and history endpoints (spec.md §6, §4.E,
//! component I's adaptive bucketing).

use crate::state::{AppState, AuthUser};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use m360_common::{history, Error, Result, Sensor, SensorConfig};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateSensor {
    pub monitor_id: String,
    pub name: String,
    pub config: SensorConfig,
}

pub async fn create(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Json(body): Json<CreateSensor>) -> Result<Json<Sensor>> {
    let sensor_type = match &body.config {
        SensorConfig::Ping(_) => m360_common::SensorType::Ping,
        SensorConfig::Ethernet(_) => m360_common::SensorType::Ethernet,
    };
    let sensor = Sensor { id: Uuid::new_v4().to_string(), monitor_id: body.monitor_id, sensor_type, name: body.name, config: body.config, owner_id };
    app.runtime.store.create_sensor(&sensor)?;
    app.runtime.scheduler.restart(&sensor.id).await?;
    Ok(Json(sensor))
}

#[derive(Deserialize)]
pub struct UpdateSensor {
    pub name: String,
    pub config: SensorConfig,
}

pub async fn update(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>, Json(body): Json<UpdateSensor>) -> Result<Json<Sensor>> {
    let mut sensor = app.runtime.store.get_sensor(&owner_id, &id)?;
    sensor.name = body.name;
    sensor.config = body.config;
    app.runtime.store.update_sensor(&sensor)?;
    // Creating/updating/restarting a sensor cancels its prior task and
    // respawns it (spec.md §4.E).
    app.runtime.scheduler.restart(&sensor.id).await?;
    Ok(Json(sensor))
}

pub async fn remove(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<()> {
    app.runtime.store.get_sensor(&owner_id, &id)?;
    app.runtime.scheduler.cancel(&id).await;
    app.runtime.store.delete_sensor(&owner_id, &id)
}

pub async fn restart(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<()> {
    app.runtime.store.get_sensor(&owner_id, &id)?;
    app.runtime.scheduler.restart(&id).await
}

pub async fn details(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    let sensor = app.runtime.store.get_sensor(&owner_id, &id)?;
    let device = app.runtime.store.device_for_sensor(&sensor)?;
    let latest = match sensor.sensor_type {
        m360_common::SensorType::Ping => app.runtime.store.latest_ping_result(&sensor.id)?.map(|r| serde_json::to_value(r).unwrap_or(json!({}))),
        m360_common::SensorType::Ethernet => app.runtime.store.latest_ethernet_result(&sensor.id)?.map(|r| serde_json::to_value(r).unwrap_or(json!({}))),
    };
    Ok(Json(json!({
        "sensor": sensor,
        "device": device,
        "latest": latest,
        "running": app.runtime.scheduler.running_sensor_ids().contains(&sensor.id),
    })))
}

#[derive(Deserialize)]
pub struct HistoryRangeQuery {
    time_range: String,
}

fn range_seconds(time_range: &str) -> Result<i64> {
    match time_range {
        "1h" => Ok(3600),
        "12h" => Ok(12 * 3600),
        "24h" => Ok(24 * 3600),
        "7d" => Ok(7 * 86400),
        "30d" => Ok(30 * 86400),
        other => Err(Error::InvalidConfig(format!("unknown time_range {other}"))),
    }
}

pub async fn history_range(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>, Query(q): Query<HistoryRangeQuery>) -> Result<Json<serde_json::Value>> {
    let sensor = app.runtime.store.get_sensor(&owner_id, &id)?;
    let seconds = range_seconds(&q.time_range)?;
    let until = Utc::now().timestamp();
    let since = until - seconds;
    let rows = match sensor.sensor_type {
        m360_common::SensorType::Ping => serde_json::to_value(app.runtime.store.ping_results_range(&sensor.id, since, until)?).unwrap_or(json!([])),
        m360_common::SensorType::Ethernet => serde_json::to_value(app.runtime.store.ethernet_results_range(&sensor.id, since, until)?).unwrap_or(json!([])),
    };
    Ok(Json(json!({"sensor_id": sensor.id, "since": since, "until": until, "rows": rows})))
}

#[derive(Deserialize)]
pub struct HistoryWindowQuery {
    start: i64,
    end: i64,
    #[serde(default = "default_max_points")]
    max_points: i64,
    #[serde(default = "default_mode")]
    mode: String,
}

fn default_max_points() -> i64 {
    300
}

fn default_mode() -> String {
    "auto".to_string()
}

pub async fn history_window(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>, Query(q): Query<HistoryWindowQuery>) -> Result<Json<serde_json::Value>> {
    let sensor = app.runtime.store.get_sensor(&owner_id, &id)?;
    if q.end <= q.start {
        return Err(Error::InvalidConfig("end must be after start".into()));
    }

    if q.mode == "raw" {
        let rows = match sensor.sensor_type {
            m360_common::SensorType::Ping => serde_json::to_value(app.runtime.store.ping_results_range(&sensor.id, q.start, q.end)?).unwrap_or(json!([])),
            m360_common::SensorType::Ethernet => serde_json::to_value(app.runtime.store.ethernet_results_range(&sensor.id, q.start, q.end)?).unwrap_or(json!([])),
        };
        return Ok(Json(json!({"sensor_id": sensor.id, "mode": "raw", "rows": rows})));
    }

    let width = history::bucket_width_secs(q.end - q.start, q.max_points);
    let rows = match sensor.sensor_type {
        m360_common::SensorType::Ping => {
            let rows = app.runtime.store.ping_results_range(&sensor.id, q.start, q.end)?;
            serde_json::to_value(history::bucket_ping_results(&rows, q.start, width)).unwrap_or(json!([]))
        }
        m360_common::SensorType::Ethernet => {
            let rows = app.runtime.store.ethernet_results_range(&sensor.id, q.start, q.end)?;
            serde_json::to_value(history::bucket_ethernet_results(&rows, q.start, width)).unwrap_or(json!([]))
        }
    };
    Ok(Json(json!({"sensor_id": sensor.id, "mode": "auto", "bucket_width_secs": width, "rows": rows})))
}
