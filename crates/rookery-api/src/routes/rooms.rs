use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rookery_core::membership;
use rookery_core::AppState;
use rookery_models::room::RoomKind;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: RoomKind,
    #[serde(default)]
    pub federated: bool,
    #[serde(default)]
    pub invitees: Vec<String>,
}

fn default_kind() -> RoomKind {
    RoomKind::Public
}

#[derive(Deserialize)]
pub struct UpdateRoomRequest {
    pub name: Option<String>,
    pub topic: Option<String>,
}

pub async fn list_rooms(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let rooms = membership::rooms_for(&state, auth.identity_id).await?;
    Ok(Json(json!(rooms)))
}

pub async fn create_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (view, invited) = membership::create_room(
        &state,
        auth.identity_id,
        &body.name,
        body.kind,
        body.federated,
        &body.invitees,
    )
    .await?;
    let mut payload = json!(view);
    if let Some(invited) = invited {
        payload["invite"] = json!(invited);
    }
    Ok((StatusCode::CREATED, Json(payload)))
}

pub async fn get_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let view = membership::room_view(&state, &room_id, auth.identity_id).await?;
    Ok(Json(json!(view)))
}

/// Rename and/or change the topic. Each change is its own event.
pub async fn update_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<String>,
    Json(body): Json<UpdateRoomRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.name.is_none() && body.topic.is_none() {
        return Err(ApiError::BadRequest("nothing to update".into()));
    }
    let mut event_ids = Vec::new();
    if let Some(name) = body.name.as_deref() {
        let applied = membership::rename(&state, &room_id, auth.identity_id, name).await?;
        event_ids.extend(applied.event_id);
    }
    if let Some(topic) = body.topic.as_deref() {
        let applied = membership::change_topic(&state, &room_id, auth.identity_id, topic).await?;
        event_ids.extend(applied.event_id);
    }
    let view = membership::room_view(&state, &room_id, auth.identity_id).await?;
    let mut payload = json!(view);
    payload["event_ids"] = json!(event_ids);
    Ok(Json(payload))
}

pub async fn delete_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let applied = membership::delete(&state, &room_id, auth.identity_id).await?;
    Ok(Json(json!(applied)))
}

pub async fn leave_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let applied = membership::leave(&state, &room_id, auth.identity_id).await?;
    Ok(Json(json!(applied)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let messages = membership::timeline(&state, &room_id, auth.identity_id).await?;
    Ok(Json(json!(messages)))
}
