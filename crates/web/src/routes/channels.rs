//! `POST/GET/DELETE /api/channels[/id]` and the Telegram chat-listing helper
//! (spec.md §6). The Telegram/Webhook notifiers themselves are out of
//! scope (spec.md §1); this only looks up a stored bot token well enough to
//! proxy the one read-only call the channel-setup UI needs.

use crate::state::{AppState, AuthUser};
use axum::extract::{Path, State};
use axum::Json;
use m360_common::{ChannelType, Error, NotificationChannel, Result};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateChannel {
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub config: serde_json::Value,
}

pub async fn create(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Json(body): Json<CreateChannel>) -> Result<Json<NotificationChannel>> {
    let channel = NotificationChannel { id: Uuid::new_v4().to_string(), name: body.name, channel_type: body.channel_type, config: body.config, owner_id };
    app.runtime.store.create_channel(&channel)?;
    Ok(Json(channel))
}

pub async fn list(State(app): State<AppState>, AuthUser(owner_id): AuthUser) -> Result<Json<Vec<NotificationChannel>>> {
    Ok(Json(app.runtime.store.list_channels(&owner_id)?))
}

pub async fn remove(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Path(id): Path<String>) -> Result<()> {
    app.runtime.store.delete_channel(&owner_id, &id)
}

#[derive(Deserialize)]
pub struct TelegramChatsRequest {
    pub channel_id: String,
}

pub async fn telegram_get_chats(State(app): State<AppState>, AuthUser(owner_id): AuthUser, Json(body): Json<TelegramChatsRequest>) -> Result<Json<serde_json::Value>> {
    let channel = app.runtime.store.get_channel(&owner_id, &body.channel_id)?;
    if channel.channel_type != ChannelType::Telegram {
        return Err(Error::InvalidConfig("channel is not a telegram channel".into()));
    }
    let bot_token = channel.config.get("bot_token").and_then(|v| v.as_str()).ok_or_else(|| Error::InvalidConfig("channel config missing bot_token".into()))?;

    let url = format!("https://api.telegram.org/bot{bot_token}/getUpdates");
    let resp = reqwest::get(&url).await.map_err(|e| Error::Upstream(format!("telegram getUpdates failed: {e}")))?;
    let body: serde_json::Value = resp.json().await.map_err(|e| Error::Upstream(format!("telegram response parse failed: {e}")))?;
    let chats: Vec<serde_json::Value> = body
        .get("result")
        .and_then(|r| r.as_array())
        .map(|updates| {
            updates
                .iter()
                .filter_map(|u| u.get("message").and_then(|m| m.get("chat")))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    Ok(Json(json!({"chats": chats})))
}
