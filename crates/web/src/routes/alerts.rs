//! `GET /api/alerts/history` (spec.md §6).

use crate::state::{AppState, AuthUser};
use axum::extract::{Query, State};
use axum::Json;
use m360_common::{AlertHistoryEntry, Result};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn history(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Query(q): Query<HistoryQuery>) -> Result<Json<Vec<AlertHistoryEntry>>> {
    Ok(Json(app.runtime.store.alert_history_for_owner(&owner_id, q.limit)?))
}
