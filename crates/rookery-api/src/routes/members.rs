use axum::{
    extract::{Path, State},
    Json,
};
use rookery_core::membership;
use rookery_core::AppState;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize)]
pub struct InviteRequest {
    pub handles: Vec<String>,
}

pub async fn list_members(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let members = membership::members(&state, &room_id, auth.identity_id).await?;
    Ok(Json(json!(members)))
}

pub async fn invite_members(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<String>,
    Json(body): Json<InviteRequest>,
) -> Result<Json<Value>, ApiError> {
    let applied = membership::invite(&state, &room_id, auth.identity_id, &body.handles).await?;
    Ok(Json(json!(applied)))
}

pub async fn remove_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((room_id, handle)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let applied = membership::remove(&state, &room_id, auth.identity_id, &handle).await?;
    Ok(Json(json!(applied)))
}
